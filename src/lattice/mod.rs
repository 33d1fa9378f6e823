/// Candidate lattice and referenced-candidate lists

pub mod candidates;
pub mod pind_list;

pub use candidates::{Lattice, ValueGroup};
pub use pind_list::{PindEntry, PindList};
