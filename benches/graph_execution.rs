//! Benchmarks for graph construction, execution and sync planning.
//!
//! Measures the overhead of:
//! - Group construction and validation
//! - Dispatching a run through the graph executor
//! - Planning a transfer against a large destination snapshot

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::runtime::Runtime;
use tributary::sync::{SourceItem, casefold, plan_transfer};
use tributary::tasks::NoopTask;
use tributary::{GraphExecutor, PipelineGraph, SyncLayout, TaskGroup, TaskNode};

fn noop(name: String) -> TaskNode {
    TaskNode::new(NoopTask::new(name))
}

/// One group: task_0 -> task_1 -> ... -> task_n
fn linear_group(size: usize) -> TaskGroup {
    TaskGroup::builder("linear")
        .chain((0..size).map(|i| noop(format!("task_{}", i))))
        .build()
        .unwrap()
}

/// One group: root -> [leaf_0, leaf_1, ...]
fn wide_group(size: usize) -> TaskGroup {
    let mut builder = TaskGroup::builder("wide").task(noop("root".into()));
    for i in 0..size {
        builder = builder.task_after(noop(format!("leaf_{}", i)), &["root"]);
    }
    builder.build().unwrap()
}

/// `groups` groups in a chain, each a linear group of `per_group` tasks.
fn layered_graph(groups: usize, per_group: usize) -> PipelineGraph {
    let mut builder = PipelineGraph::builder("layered", "Layered").max_concurrent_tasks(8);
    for g in 0..groups {
        let id = format!("group_{}", g);
        let group = TaskGroup::builder(id.as_str())
            .chain((0..per_group).map(|i| noop(format!("task_{}", i))))
            .build()
            .unwrap();
        if g == 0 {
            builder = builder.group(group);
        } else {
            let prev = format!("group_{}", g - 1);
            builder = builder.group_after(group, &[prev.as_str()]);
        }
    }
    builder.build().unwrap()
}

fn bench_group_construction(c: &mut Criterion) {
    let mut group = c.benchmark_group("group_construction");

    for size in [100, 500].iter() {
        group.bench_with_input(BenchmarkId::new("linear", size), size, |b, &size| {
            b.iter(|| linear_group(size));
        });

        group.bench_with_input(BenchmarkId::new("wide", size), size, |b, &size| {
            b.iter(|| wide_group(size));
        });
    }

    group.finish();
}

fn bench_graph_execution(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("graph_execution");

    for (groups, per_group) in [(6, 5), (10, 50)] {
        let graph = Arc::new(layered_graph(groups, per_group));
        let label = format!("{}x{}", groups, per_group);
        group.bench_with_input(BenchmarkId::new("layered", label), &graph, |b, graph| {
            let executor = GraphExecutor::new();
            b.iter(|| rt.block_on(async { executor.run(graph).await }));
        });
    }

    group.finish();
}

fn bench_plan_transfer(c: &mut Criterion) {
    let mut group = c.benchmark_group("plan_transfer");
    let layout = SyncLayout {
        prefix: "raw/".into(),
        ..SyncLayout::default()
    };

    for size in [100, 1000].iter() {
        let source: Vec<SourceItem> = (0..*size)
            .map(|i| {
                let filename = format!("items-{}.zip", i);
                SourceItem::new(format!("https://source.test/{}", filename), filename)
            })
            .collect();
        // Half of the items already landed, under upper-case names.
        let destination: BTreeSet<String> = (0..*size)
            .step_by(2)
            .map(|i| format!("raw/ITEMS-{}.TXT", i))
            .collect();

        group.bench_with_input(BenchmarkId::new("half_present", size), size, |b, _| {
            b.iter(|| plan_transfer(source.clone(), &destination, &layout, casefold));
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_group_construction,
    bench_graph_execution,
    bench_plan_transfer
);

criterion_main!(benches);
