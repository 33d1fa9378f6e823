/// Integration tests for the aggregation and merge pipeline and the file outputs

use spind::spill::{merge_runs, AggregationTarget, Aggregator, ArrowChunkFormat, MergeScheduler, RunReader};
use spind::{
    AttributeId, CsvOptions, DiscoveryConfig, RelationInput, SpindEngine, TextReportSink,
};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn read_records(path: &Path) -> Vec<(String, Vec<(AttributeId, u64)>)> {
    let mut reader = RunReader::open(path, 0).unwrap();
    let mut records = Vec::new();
    while let Some(entry) = reader.next_entry().unwrap() {
        let counts = entry.attribute_counts(path).unwrap();
        records.push((entry.value, counts));
    }
    records
}

#[test]
fn test_aggregate_then_merge_counts_every_row_once() {
    let dir = TempDir::new().unwrap();
    let values = ["x", "y", "z", "x\ny", "x", "w", "y", "x"];
    let mut chunks = Vec::new();
    for (i, slice) in values.chunks(3).enumerate() {
        let path = dir.path().join(format!("chunk_{}.arrow", i));
        let rows: Vec<Vec<Option<String>>> = slice
            .iter()
            .map(|v| vec![Some(v.to_string()), Some(format!("{}{}", v, v))])
            .collect();
        ArrowChunkFormat::write_chunk(&path, 2, &rows).unwrap();
        chunks.push(path);
    }

    let config = DiscoveryConfig {
        sort_memory_budget: 2,
        parallelism: 1,
        ..Default::default()
    };
    let aggregator = Aggregator::new(&config, 1, None, dir.path());
    let targets = [
        AggregationTarget { id: 0, columns: vec![0] },
        AggregationTarget { id: 1, columns: vec![1] },
    ];
    let mut runs = Vec::new();
    for (i, chunk) in chunks.iter().enumerate() {
        runs.extend(aggregator.aggregate(0, i, chunk, &targets).unwrap().runs);
    }
    assert!(runs.len() > chunks.len(), "a budget of two pairs must spill");

    let destination = dir.path().join("relation.txt");
    let output = merge_runs(&runs, &destination, true).unwrap();
    let records = read_records(&destination);

    assert!(records.windows(2).all(|w| w[0].0 < w[1].0), "one record per value, sorted");
    let x = records.iter().find(|(value, _)| value == "x").unwrap();
    assert_eq!(x.1, vec![(0, 3)]);
    assert!(records.iter().any(|(value, _)| value == "x\\ny"), "newlines are escaped");
    assert_eq!(output.statistics[&0].total_occurrences, 8);
    assert_eq!(output.statistics[&0].distinct_values, 5);
    assert_eq!(output.statistics[&1].total_occurrences, 8);
}

#[test]
fn test_wave_merge_is_a_fixed_point() {
    let dir = TempDir::new().unwrap();
    let mut runs = Vec::new();
    for i in 0..7 {
        let path = dir.path().join(format!("run_{}.txt", i));
        let mut writer = spind::spill::RunWriter::create(&path).unwrap();
        for v in (i..20).step_by(3) {
            writer.write_record(&format!("{:03}", v), &[(i % 3, 1)]).unwrap();
        }
        writer.finish().unwrap();
        runs.push(path);
    }

    let pool = rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap();
    let mut pending: BTreeMap<usize, Vec<PathBuf>> = BTreeMap::new();
    pending.insert(0, runs);
    let summary = MergeScheduler::new(&pool, 3, dir.path(), 1).merge_all(pending).unwrap();
    let merged = summary.final_files[&0].clone();

    let copy = dir.path().join("copy.txt");
    std::fs::copy(&merged, &copy).unwrap();
    let again = dir.path().join("again.txt");
    merge_runs(&[copy], &again, true).unwrap();
    assert_eq!(std::fs::read(&merged).unwrap(), std::fs::read(&again).unwrap());
}

#[test]
fn test_csv_run_writes_reports_and_metrics() {
    let data = TempDir::new().unwrap();
    let orders = data.path().join("orders.csv");
    let customers = data.path().join("customers.csv");
    std::fs::write(&orders, "id,customer\n1,10\n2,11\n3,10\n").unwrap();
    std::fs::write(&customers, "id,name\n10,ann\n11,bob\n12,cyd\n").unwrap();

    let scratch = TempDir::new().unwrap();
    let results = TempDir::new().unwrap();
    let config = DiscoveryConfig {
        temp_dir: scratch.path().to_path_buf(),
        result_dir: Some(results.path().to_path_buf()),
        execution_name: "shop".to_string(),
        parallelism: 2,
        ..Default::default()
    };
    let engine = SpindEngine::new(config).unwrap();
    let inputs = vec![
        RelationInput::csv("orders", &orders, &CsvOptions::default()).unwrap(),
        RelationInput::csv("customers", &customers, &CsvOptions::default()).unwrap(),
    ];
    let mut sink = TextReportSink::new(results.path());
    let report = engine.run(inputs, &mut sink).unwrap();

    let unary = std::fs::read_to_string(TextReportSink::report_file(results.path(), 1)).unwrap();
    assert!(unary.lines().any(|line| line == "(orders.customer) <= (customers.id)"), "{}", unary);

    let metrics_file = report.metrics_file.unwrap();
    assert!(metrics_file.exists());
    let metrics: HashMap<String, serde_json::Value> =
        serde_json::from_str(&std::fs::read_to_string(&metrics_file).unwrap()).unwrap();
    assert_eq!(metrics["execution_name"], "shop");
    assert_eq!(report.metrics.relations, 2);
    assert_eq!(report.metrics.rows, 6);
    assert!(report.metrics.layers[0].sort_files > 0);
    let unary_layer = &report.metrics.layers[0];
    assert!(unary_layer.filter_values >= 2, "shared values 10 and 11 enter the filter");
    assert!(unary_layer.filter_bits_set > 0);
    assert!(unary_layer.filter_false_positive_rate > 0.0 && unary_layer.filter_false_positive_rate < 1.0);
    assert_eq!(std::fs::read_dir(scratch.path()).unwrap().count(), 0);
}
