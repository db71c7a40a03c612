use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use crate::config::{CoreDirConfig, CoreServerConfig, Matcher, Section};

use super::{defaults, pipeline, server_with, tagged, tags_of, MemoryFS};

fn url_server(merges: &Arc<AtomicUsize>) -> CoreServerConfig {
    server_with(defaults()).with_url_sections(vec![
        Section::location(Matcher::literal("/"), tagged("root", merges, CoreDirConfig::default())),
        Section::location(
            Matcher::literal("/docs"),
            tagged("docs", merges, CoreDirConfig::default()),
        ),
        Section::location(
            Matcher::glob("/*/admin"),
            tagged("admin", merges, CoreDirConfig::default()),
        ),
        Section::location(
            Matcher::regex("^/(?P<app>[a-z]+)/v(?P<version>[0-9]+)/").unwrap(),
            tagged("versioned", merges, CoreDirConfig::default()),
        ),
    ])
}

#[test]
fn literal_sections_merge_in_declared_order() {
    let merges = Arc::new(AtomicUsize::new(0));
    let p = pipeline(MemoryFS::new(), url_server(&merges));

    let mut r = p.new_request("GET", "/docs/guide.html");
    p.location_walk(&mut r).unwrap();
    assert_eq!(tags_of(&r), ["root", "docs"]);

    // "/docs" must not swallow "/docsextra".
    let mut r = p.new_request("GET", "/docsextra");
    p.location_walk(&mut r).unwrap();
    assert_eq!(tags_of(&r), ["root"]);
}

#[test]
fn glob_and_regex_sections() {
    let merges = Arc::new(AtomicUsize::new(0));
    let p = pipeline(MemoryFS::new(), url_server(&merges));

    let mut r = p.new_request("GET", "/shop/admin");
    p.location_walk(&mut r).unwrap();
    assert_eq!(tags_of(&r), ["root", "admin"]);

    let mut r = p.new_request("GET", "/shop/v2/items");
    p.location_walk(&mut r).unwrap();
    assert_eq!(tags_of(&r), ["root", "versioned"]);
    // Named captures land in the environment.
    assert_eq!(r.subprocess_env.get("app").map(String::as_str), Some("shop"));
    assert_eq!(r.subprocess_env.get("version").map(String::as_str), Some("2"));
}

#[test]
fn repeated_walk_reuses_cached_result() {
    let merges = Arc::new(AtomicUsize::new(0));
    let p = pipeline(MemoryFS::new(), url_server(&merges));

    let mut r = p.new_request("GET", "/docs/guide.html");
    p.location_walk(&mut r).unwrap();
    let first = Arc::clone(&r.per_dir_config);
    let merged_once = merges.load(Ordering::Relaxed);

    p.location_walk(&mut r).unwrap();
    assert!(Arc::ptr_eq(&first, &r.per_dir_config));
    assert_eq!(merges.load(Ordering::Relaxed), merged_once);
}

#[test]
fn unmerged_slashes_still_match_collapsed() {
    let merges = Arc::new(AtomicUsize::new(0));
    let server = url_server(&merges).with_merge_slashes(false);
    let p = pipeline(MemoryFS::new(), server);

    let mut r = p.new_request("GET", "//docs//guide.html");
    p.location_walk(&mut r).unwrap();
    assert_eq!(tags_of(&r), ["root", "docs"]);
}
