// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
#![allow(missing_docs, clippy::unwrap_used)]

//! S6: a two-layer diamond of 0.5s-sleeping nodes completes in well under
//! the sum of their sleeps, proving the scheduler actually overlaps
//! independent work rather than serializing it, driven through a real
//! [`Engine`] rather than `echo-sched`'s lower-level `Scheduler` unit test
//! for the same property.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};

use echo_kernel::{Context, Engine, RunOptions};
use echo_tasks::{ArgValue, DynTask, Future};

struct SleepTask {
    id: &'static str,
    prevs: Vec<Future>,
}
impl DynTask for SleepTask {
    fn class_name(&self) -> &'static str {
        "SleepTask"
    }
    fn source_token(&self) -> String {
        "v1".to_string()
    }
    fn args(&self) -> BTreeMap<String, ArgValue> {
        let mut m = BTreeMap::new();
        m.insert("id".to_string(), ArgValue::Literal(json!(self.id)));
        for (i, prev) in self.prevs.iter().enumerate() {
            m.insert(format!("prev{i}"), ArgValue::Future(prev.clone()));
        }
        m
    }
    fn run(
        &self,
        _inputs: &BTreeMap<String, Value>,
        _scratch_dir: &Path,
    ) -> Result<Value, Box<dyn std::error::Error + Send + Sync>> {
        std::thread::sleep(Duration::from_millis(500));
        Ok(json!(self.id))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn diamond_of_sleeps_completes_well_under_the_serial_sum() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::new(Context::new(dir.path()));

    let t1 = Future::task(Arc::new(SleepTask {
        id: "1",
        prevs: Vec::new(),
    }));
    let t2 = Future::task(Arc::new(SleepTask {
        id: "2",
        prevs: Vec::new(),
    }));
    let t3 = Future::task(Arc::new(SleepTask {
        id: "3",
        prevs: vec![t1],
    }));
    let t4 = Future::task(Arc::new(SleepTask {
        id: "4",
        prevs: vec![t2],
    }));
    let t5 = Future::task(Arc::new(SleepTask {
        id: "5",
        prevs: vec![t3, t4],
    }));

    let start = Instant::now();
    let value = engine.run_graph(&t5, RunOptions::default()).await.unwrap();
    let elapsed = start.elapsed();

    assert_eq!(value, json!("5"));
    assert!(
        elapsed < Duration::from_secs(2),
        "five serialized 0.5s sleeps would take 2.5s; a scheduler that runs \
         independent branches (1/2, then 3/4) in parallel should finish in \
         about 1.5s, well under 2s: took {elapsed:?}"
    );
}
