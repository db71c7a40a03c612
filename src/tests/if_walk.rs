use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use rustc_hash::FxHashMap;

use crate::config::{Condition, ConfigVector, CoreDirConfig, Section};

use super::{pipeline, server_with, tagged, tags_of, MemoryFS, TableEval, TestPipeline};

fn eval(exprs: &[(&str, bool)]) -> Box<TableEval> {
    let mut table = FxHashMap::default();
    for (expr, value) in exprs {
        table.insert((*expr).to_string(), *value);
    }
    Box::new(TableEval { exprs: table })
}

fn if_pipeline(sections: Vec<Section>, exprs: &[(&str, bool)]) -> TestPipeline {
    let core = CoreDirConfig::default().with_if_sections(sections);
    pipeline(
        MemoryFS::new(),
        server_with(Arc::new(ConfigVector::with_core(core))),
    )
    .with_condition_eval(eval(exprs))
}

fn chain(merges: &Arc<AtomicUsize>) -> Vec<Section> {
    vec![
        Section::condition(
            Condition::If("first".into()),
            tagged("first", merges, CoreDirConfig::default()),
        ),
        Section::condition(
            Condition::Else,
            tagged("not-first", merges, CoreDirConfig::default()),
        ),
        Section::condition(
            Condition::If("second".into()),
            tagged("second", merges, CoreDirConfig::default()),
        ),
        Section::condition(
            Condition::ElseIf("third".into()),
            tagged("third", merges, CoreDirConfig::default()),
        ),
        Section::condition(
            Condition::Else,
            tagged("fallback", merges, CoreDirConfig::default()),
        ),
    ]
}

#[test]
fn if_true_suppresses_its_else() {
    let merges = Arc::new(AtomicUsize::new(0));
    let p = if_pipeline(
        chain(&merges),
        &[("first", true), ("second", false), ("third", false)],
    );

    let mut r = p.new_request("GET", "/");
    p.if_walk(&mut r).unwrap();
    assert_eq!(tags_of(&r), ["first", "fallback"]);
}

#[test]
fn else_fires_after_false_if() {
    let merges = Arc::new(AtomicUsize::new(0));
    let p = if_pipeline(
        chain(&merges),
        &[("first", false), ("second", false), ("third", true)],
    );

    let mut r = p.new_request("GET", "/");
    p.if_walk(&mut r).unwrap();
    assert_eq!(tags_of(&r), ["not-first", "third"]);
}

#[test]
fn evaluator_error_counts_as_non_match() {
    let merges = Arc::new(AtomicUsize::new(0));
    let sections = vec![
        Section::condition(
            Condition::If("unknown".into()),
            tagged("broken", &merges, CoreDirConfig::default()),
        ),
        Section::condition(
            Condition::Else,
            tagged("rescue", &merges, CoreDirConfig::default()),
        ),
    ];
    let p = if_pipeline(sections, &[]);

    let mut r = p.new_request("GET", "/");
    p.if_walk(&mut r).unwrap();
    assert_eq!(tags_of(&r), ["rescue"]);
}

#[test]
fn nested_if_sections_participate() {
    let merges = Arc::new(AtomicUsize::new(0));
    let inner = Section::condition(
        Condition::If("inner".into()),
        tagged("inner", &merges, CoreDirConfig::default()),
    );
    let outer = Section::condition(Condition::If("outer".into()), {
        let mut vector = ConfigVector::with_core(
            CoreDirConfig::default().with_if_sections(vec![inner]),
        );
        vector.set(
            super::PROBE_MODULE,
            Arc::new(super::Probe { tags: vec!["outer"], merges: Arc::clone(&merges) }),
        );
        Arc::new(vector)
    });
    let p = if_pipeline(vec![outer], &[("outer", true), ("inner", true)]);

    let mut r = p.new_request("GET", "/");
    p.if_walk(&mut r).unwrap();
    assert_eq!(tags_of(&r), ["outer", "inner"]);
}

#[test]
fn rewalk_from_same_base_reuses_cached_result() {
    let merges = Arc::new(AtomicUsize::new(0));
    let p = if_pipeline(chain(&merges), &[
        ("first", true),
        ("second", true),
        ("third", false),
    ]);

    let mut r = p.new_request("GET", "/");
    p.if_walk(&mut r).unwrap();
    let config = Arc::clone(&r.per_dir_config);
    let merged = merges.load(Ordering::Relaxed);

    // A rewalk from the same base config must hand back the identical
    // merge result without doing the work again.
    r.per_dir_config = Arc::clone(&p.server().lookup_defaults);
    p.if_walk(&mut r).unwrap();
    assert!(Arc::ptr_eq(&config, &r.per_dir_config));
    assert_eq!(merges.load(Ordering::Relaxed), merged);
}
