//! Builds a trace the way the monitors do, without perf, and checks the
//! archive that comes out.

mod common;

use std::sync::Arc;

use lo2s::location::{Location, NO_PARENT_PROCESS_PID};
use lo2s::metric::MetricWriter;
use lo2s::mmap::{Mapping, NoLineInfo, ProcessMap};
use lo2s::monitor::SampleWriter;
use lo2s::perf::record::SampleRecord;
use lo2s::perf::RecordHandler;
use lo2s::time::{TimeConverter, Timestamp};
use lo2s::topology::{Cpu, Topology};
use lo2s::trace::{MetricScope, MetricSpec, MetricValue, Trace, TraceOptions};
use serde_json::Value;
use tempfile::TempDir;

use common::{definitions, read_json, read_json_lines, string};

fn options(dir: &TempDir) -> TraceOptions {
    TraceOptions {
        description: "lo2s -e cpu-cycles -- app".into(),
        hostname: "node7".into(),
        topology: Topology::from_cpus((0..2).map(|id| Cpu {
            id,
            core_id: id,
            package_id: 0,
        })),
        sampling_event: "instructions".into(),
        sampling_period: 1000,
        counters: vec![MetricSpec::new("cpu-cycles", "#")],
        output_link: Some(dir.path().join("latest")),
        ..TraceOptions::default()
    }
}

fn sample(tid: libc::pid_t, time: u64, ips: &[u64]) -> SampleRecord {
    SampleRecord {
        ip: ips[0],
        pid: 300,
        tid,
        time,
        cpu: 1,
        read: Vec::new(),
        // Innermost frame first, as the kernel reports it.
        callchain: ips.to_vec(),
    }
}

#[test]
fn test_full_archive() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("lo2s_trace_test");
    let trace = Arc::new(Trace::new(&path, options(&dir)).unwrap());
    let processes = Arc::new(ProcessMap::new());

    trace.add_process(300, NO_PARENT_PROCESS_PID, "app").unwrap();
    trace.add_thread(300, "app");
    trace.add_monitored_thread(300, 301);
    trace.update_thread_name(301, "worker");
    processes.insert_process(300, false);
    processes.mmap(
        300,
        Mapping {
            start: 0x400000,
            end: 0x500000,
            pgoff: 0,
            filename: "/opt/app/bin/app".into(),
        },
    );

    trace.begin_record();
    let mut locations = Vec::new();
    for tid in [300, 301] {
        let writer = trace.sample_writer(Location::thread(tid)).unwrap();
        locations.push(writer.location());
        let mut samples = SampleWriter::new(
            trace.clone(),
            processes.clone(),
            TimeConverter::identity(),
            writer,
            None,
            false,
        );
        samples.handle_sample(&sample(tid, 100, &[0x400010, 0x400100])).unwrap();
        samples.handle_sample(&sample(tid, 200, &[0x400020, 0x400100])).unwrap();
        samples.finish(&mut NoLineInfo).unwrap();
    }

    let scope = MetricScope::Location(locations[0]);
    let mut metrics = MetricWriter::open(
        &trace,
        Location::thread(300),
        trace.perf_metric_class().unwrap(),
        scope,
    )
    .unwrap();
    metrics
        .write(
            Timestamp(150),
            vec![
                MetricValue::Double(1.5e6),
                MetricValue::Unsigned(1000),
                MetricValue::Unsigned(900),
            ],
        )
        .unwrap();
    metrics.close().unwrap();
    trace.end_record();
    let finished = trace.finalize().unwrap();
    assert_eq!(finished, path);

    let anchor = read_json(&path.join("traces.otf2"));
    assert!(anchor["creator"].as_str().unwrap().starts_with("lo2s - "));
    assert_eq!(anchor["description"], "lo2s -e cpu-cycles -- app");
    assert!(anchor["clock_properties"]["global_offset"].as_u64().unwrap() > 0);

    let defs = read_json_lines(&path.join("traces.def"));
    let location_defs = definitions(&defs, "location");
    assert_eq!(
        anchor["number_of_locations"].as_u64().unwrap() as usize,
        location_defs.len()
    );
    let names: Vec<&str> = location_defs
        .iter()
        .map(|l| string(&defs, &l["name"]))
        .collect();
    assert!(names.contains(&"app (300)"));
    assert!(names.contains(&"worker (301)"));
    assert!(names.contains(&"metrics for thread 300"));

    // Both threads share the location group of their process.
    let groups: Vec<&Value> = location_defs
        .iter()
        .filter(|l| l["type"] == "cpu_thread")
        .map(|l| &l["group"])
        .collect();
    assert!(groups.windows(2).all(|w| w[0] == w[1]));

    // Same frames below different thread roots are different contexts.
    let cctx_ids: Vec<&Value> = definitions(&defs, "calling_context")
        .iter()
        .map(|c| &c["ref"])
        .collect();
    for location in &locations {
        let local = read_json(&path.join(format!("traces/{}.def", location.id())));
        assert_eq!(local["number_of_events"], 2);
        let mappings = local["mapping_tables"][0]["mappings"].as_array().unwrap();
        // thread root, the shared outer frame and two leaves
        assert_eq!(mappings.len(), 4);
        for id in mappings {
            assert!(cctx_ids.contains(&id), "unmapped calling context {id}");
        }
        let events = read_json_lines(&path.join(format!("traces/{}.evt", location.id())));
        assert!(events.iter().all(|e| e["type"] == "calling_context_sample"));
    }

    let region_groups: Vec<&str> = definitions(&defs, "regions_group")
        .iter()
        .map(|g| string(&defs, &g["name"]))
        .collect();
    assert!(region_groups.contains(&"worker"));
    assert!(region_groups.contains(&"lo2s"));

    assert_eq!(
        std::fs::read_link(dir.path().join("latest")).unwrap(),
        path.canonicalize().unwrap()
    );
}

#[test]
fn test_existing_trace_is_not_overwritten() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("trace");
    let trace = Trace::new(&path, options(&dir)).unwrap();
    trace.finalize().unwrap();
    assert!(Trace::new(&path, options(&dir)).is_err());
}
