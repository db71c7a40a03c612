use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use http::StatusCode;

use crate::{
    config::{CoreDirConfig, Matcher, Section},
    file_system::{FileInfo, FileKind},
    request::SUBREQ_CORE_FILTER,
    AuthScope, DirentMerge, Flow,
};

use super::{serving, server_with, tagged, MapHtaccess, MemoryFS, TestPipeline};

fn www_fs() -> MemoryFS {
    MemoryFS::new()
        .dir("/srv/www/docs/sub")
        .file("/srv/www/docs/page.html")
        .file("/srv/www/docs/other.html")
        .file("/srv/www/docs/site.css")
        .file("/srv/www/elsewhere.bin")
}

fn www_pipeline(fs: MemoryFS, server: crate::CoreServerConfig) -> TestPipeline {
    serving(fs, server, |hooks| {
        hooks.check_access_ex("authz", AuthScope::PerConf, Box::new(|_, _| Flow::Ok));
    })
}

#[test]
fn lookup_uri_resolves_relative_to_parent() {
    let p = www_pipeline(www_fs(), server_with(super::defaults()));

    let mut parent = p.new_request("GET", "/docs/page.html");
    p.process(&mut parent).unwrap();

    let child = p.lookup_uri("other.html", &parent, Some(&[]));
    assert_eq!(child.status, StatusCode::OK);
    assert_eq!(child.uri, "/docs/other.html");
    assert_eq!(child.filename.as_deref(), Some("/srv/www/docs/other.html"));
    assert!(child.is_sub_request());
    // The sub-request framing filter was inserted into the empty chain.
    assert_eq!(child.output_filters.len(), 1);
    assert_eq!(child.output_filters[0].as_ref(), SUBREQ_CORE_FILTER);
}

#[test]
fn matching_subrequest_reuses_walk_caches_wholesale() {
    let merges = Arc::new(AtomicUsize::new(0));
    let loads = Arc::new(AtomicUsize::new(0));

    let server = server_with(super::defaults()).with_url_sections(vec![Section::location(
        Matcher::literal("/docs"),
        tagged("docs", &merges, CoreDirConfig::default()),
    )]);
    let p = www_pipeline(www_fs(), server).with_htaccess_loader(Box::new(MapHtaccess {
        files: rustc_hash::FxHashMap::default(),
        loads: Arc::clone(&loads),
    }));

    let mut parent = p.new_request("GET", "/docs/");
    p.process(&mut parent).unwrap();
    assert_eq!(parent.finfo.kind, FileKind::Dir);

    let merged_by_parent = merges.load(Ordering::Relaxed);
    let loaded_by_parent = loads.load(Ordering::Relaxed);

    let child = p.lookup_uri("/docs/page.html", &parent, Some(&[]));
    assert_eq!(child.status, StatusCode::OK);
    assert_eq!(child.filename.as_deref(), Some("/srv/www/docs/page.html"));

    // Same directory, same sections, same base config: the child re-used
    // every cached merge and never consulted the override loader.
    assert_eq!(merges.load(Ordering::Relaxed), merged_by_parent);
    assert_eq!(loads.load(Ordering::Relaxed), loaded_by_parent);
    assert!(Arc::ptr_eq(&child.per_dir_config, &parent.per_dir_config));
}

#[test]
fn lookup_file_in_same_directory_rebuilds_the_uri() {
    let p = www_pipeline(www_fs(), server_with(super::defaults()));

    let mut parent = p.new_request("GET", "/docs/page.html");
    p.process(&mut parent).unwrap();

    let child = p.lookup_file("site.css", &parent, None);
    assert_eq!(child.status, StatusCode::OK);
    assert_eq!(child.uri, "/docs/site.css");
    assert_eq!(child.filename.as_deref(), Some("/srv/www/docs/site.css"));
    assert_eq!(child.finfo.kind, FileKind::File);
    assert!(child.has_canonical_filename());
}

#[test]
fn lookup_file_outside_the_directory_has_no_uri() {
    let p = www_pipeline(www_fs(), server_with(super::defaults()));

    let mut parent = p.new_request("GET", "/docs/page.html");
    p.process(&mut parent).unwrap();

    let child = p.lookup_file("/srv/www/elsewhere.bin", &parent, None);
    assert_eq!(child.status, StatusCode::OK);
    assert_eq!(child.uri, "");
    assert_eq!(child.filename.as_deref(), Some("/srv/www/elsewhere.bin"));
}

#[test]
fn lookup_dirent_joins_the_parent_directory() {
    let p = www_pipeline(www_fs(), server_with(super::defaults()));

    let mut parent = p.new_request("GET", "/docs/");
    p.process(&mut parent).unwrap();

    let dirent = FileInfo {
        kind: FileKind::File,
        owner: Some(0),
        name: Some("other.html".to_string()),
    };
    let child = p.lookup_dirent(&dirent, &parent, DirentMerge::NoArgs, None);
    assert_eq!(child.status, StatusCode::OK);
    assert_eq!(child.uri, "/docs/other.html");
    assert_eq!(child.filename.as_deref(), Some("/srv/www/docs/other.html"));

    // A directory entry gains its trailing slashes.
    let dirent = FileInfo {
        kind: FileKind::Dir,
        owner: Some(0),
        name: Some("sub".to_string()),
    };
    let child = p.lookup_dirent(&dirent, &parent, DirentMerge::NoArgs, None);
    assert_eq!(child.status, StatusCode::OK);
    assert_eq!(child.uri, "/docs/sub/");
    assert_eq!(child.filename.as_deref(), Some("/srv/www/docs/sub/"));
}

#[test]
fn lookup_dirent_can_remerge_query_arguments() {
    let p = www_pipeline(www_fs(), server_with(super::defaults()));

    let mut parent = p.new_request("GET", "/docs/page.html?a=1");
    p.process(&mut parent).unwrap();

    let dirent = FileInfo {
        kind: FileKind::File,
        owner: Some(0),
        name: Some("other.html".to_string()),
    };
    let child = p.lookup_dirent(&dirent, &parent, DirentMerge::MergeArgs, None);
    assert_eq!(child.status, StatusCode::OK);
    assert_eq!(child.args.as_deref(), Some("a=1"));
}

#[test]
fn recursion_limit_turns_into_a_server_error() {
    let server = server_with(super::defaults()).with_recursion_limits(1, 10);
    let p = www_pipeline(www_fs(), server);

    let mut parent = p.new_request("GET", "/docs/page.html");
    p.process(&mut parent).unwrap();

    let child = p.lookup_uri("other.html", &parent, None);
    assert_eq!(child.status, StatusCode::OK);

    let grandchild = p.lookup_uri("site.css", &child, None);
    assert_eq!(grandchild.status, StatusCode::INTERNAL_SERVER_ERROR);
}

#[test]
fn quick_handler_can_serve_lookups() {
    let quick = Arc::new(AtomicUsize::new(0));
    let quick_probe = Arc::clone(&quick);
    let mut p = crate::PipelineGeneric::new_with_file_system(
        www_fs(),
        Arc::new(server_with(super::defaults())),
    );
    p.hooks_mut().quick_handler.register(
        "cache",
        Box::new(move |_, _, lookup| {
            assert!(lookup);
            quick_probe.fetch_add(1, Ordering::Relaxed);
            Flow::Ok
        }),
    );
    p.finalize();

    let parent = p.new_request("GET", "/docs/page.html");
    // With a filter chain the quick handler gets first pick and serves
    // the lookup without any pipeline processing (no translate hook is
    // registered, which would otherwise fail the request).
    let child = p.lookup_uri("other.html", &parent, Some(&[]));
    assert_eq!(child.status, StatusCode::OK);
    assert_eq!(quick.load(Ordering::Relaxed), 1);

    // Without a chain the quick handler must not run; processing fails
    // on the missing translation instead.
    let child = p.lookup_uri("other.html", &parent, None);
    assert_eq!(child.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(quick.load(Ordering::Relaxed), 1);
}
