use std::fs;
use std::path::Path;
use std::process::Command;

use anyhow::Result;
use ntest::timeout;
use ptcap::{Error, Pid, TraceConfig, TraceSession};

/// A pre-existing trace output file is never overwritten.
#[test]
#[timeout(10000)]
fn test_refuses_existing_output() -> Result<()> {
    if !Path::new(ptcap::perf::PT_TYPE_PATH).exists() {
        eprintln!("intel_pt PMU not present, skipping");
        return Ok(());
    }

    let dir = tempfile::tempdir()?;
    let trace_path = dir.path().join("trace.data");
    let maps_path = dir.path().join("maps.txt");

    fs::write(&trace_path, b"previous run")?;

    let mut child = Command::new("sleep").arg("30").spawn()?;
    let pid = Pid::from_raw(child.id() as i32);

    let res = TraceSession::start(TraceConfig::new(pid, &trace_path, &maps_path));

    child.kill()?;
    child.wait()?;

    match res {
        Err(Error::Output { .. }) => {}
        Err(err @ Error::EventOpen { .. }) => {
            // The open step precedes the output step; without perf
            // permission the guard is unreachable.
            eprintln!("cannot trace in this environment ({err}), skipping");
            return Ok(());
        }
        other => panic!("expected Error::Output, got {other:?}"),
    }

    assert_eq!(fs::read(&trace_path)?, b"previous run");

    Ok(())
}
