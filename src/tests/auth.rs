use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use http::StatusCode;

use crate::{
    config::{ConfigVector, CoreDirConfig},
    error::PipelineError,
    options::Satisfy,
    request::BASIC_AUTH_PW_NOTE,
    AuthScope, Flow,
};

use super::{serving, server_with, MemoryFS};

fn www_fs() -> MemoryFS {
    MemoryFS::new().file("/srv/www/docs/page.html")
}

fn server(satisfy: Satisfy) -> crate::CoreServerConfig {
    server_with(Arc::new(ConfigVector::with_core(
        CoreDirConfig::default().with_satisfy(satisfy),
    )))
}

#[test]
fn satisfy_any_access_checker_authorizes_without_authentication() {
    let p = serving(www_fs(), server(Satisfy::Any), |hooks| {
        hooks.check_access("allow-from-anywhere", AuthScope::PerConf, Box::new(|_, _| Flow::Ok));
    });

    let mut r = p.new_request("GET", "/docs/page.html");
    p.process(&mut r).unwrap();
    assert_eq!(r.user, None);
    assert_eq!(r.auth_type, None);
    assert_eq!(r.status, StatusCode::OK);
}

#[test]
fn satisfy_all_force_authn_demands_login() {
    let forced = Arc::new(AtomicUsize::new(0));
    let forced_probe = Arc::clone(&forced);
    let p = serving(www_fs(), server(Satisfy::All), |hooks| {
        hooks.check_access_ex("authz-core", AuthScope::PerConf, Box::new(|_, _| Flow::Ok));
        hooks.force_authn.register(
            "login-required",
            Box::new(move |_, _| {
                forced_probe.fetch_add(1, Ordering::Relaxed);
                Flow::Ok
            }),
        );
        hooks.check_authn(
            "basic",
            AuthScope::PerConf,
            Box::new(|_, r| {
                r.user = Some("bob".to_string());
                r.auth_type = Some("Basic".to_string());
                Flow::Ok
            }),
        );
        hooks.check_authz("user-list", AuthScope::PerConf, Box::new(|_, _| Flow::Ok));
    });

    let mut r = p.new_request("GET", "/docs/page.html");
    p.process(&mut r).unwrap();
    assert_eq!(r.user.as_deref(), Some("bob"));
    assert_eq!(forced.load(Ordering::Relaxed), 1);
}

#[test]
fn access_checker_ex_ok_without_force_authn_skips_authentication() {
    let authn = Arc::new(AtomicUsize::new(0));
    let authn_probe = Arc::clone(&authn);
    let p = serving(www_fs(), server(Satisfy::All), |hooks| {
        hooks.check_access_ex("authz-core", AuthScope::PerConf, Box::new(|_, _| Flow::Ok));
        hooks.check_authn(
            "basic",
            AuthScope::PerConf,
            Box::new(move |_, _| {
                authn_probe.fetch_add(1, Ordering::Relaxed);
                Flow::Ok
            }),
        );
    });

    let mut r = p.new_request("GET", "/docs/page.html");
    p.process(&mut r).unwrap();
    assert_eq!(r.user, None);
    assert_eq!(authn.load(Ordering::Relaxed), 0);
}

#[test]
fn authn_reporting_ok_without_user_is_a_server_error() {
    let p = serving(www_fs(), server(Satisfy::All), |hooks| {
        hooks.check_authn("broken", AuthScope::PerConf, Box::new(|_, _| Flow::Ok));
    });

    let mut r = p.new_request("GET", "/docs/page.html");
    match p.process(&mut r) {
        Err(PipelineError::MissingUser(_)) => {
            assert_eq!(r.status, StatusCode::INTERNAL_SERVER_ERROR);
        }
        other => panic!("expected missing-user failure, got {other:?}"),
    }
}

#[test]
fn access_denied_under_satisfy_all() {
    let p = serving(www_fs(), server(Satisfy::All), |hooks| {
        hooks.check_access(
            "deny-all",
            AuthScope::PerConf,
            Box::new(|_, _| Flow::Status(StatusCode::FORBIDDEN)),
        );
    });

    let mut r = p.new_request("GET", "/docs/page.html");
    match p.process(&mut r) {
        Err(PipelineError::PhaseStatus { phase, status, .. }) => {
            assert_eq!(phase, "check access (with Satisfy All)");
            assert_eq!(status, StatusCode::FORBIDDEN);
        }
        other => panic!("expected access denial, got {other:?}"),
    }
}

#[test]
fn stale_user_from_credential_probing_is_cleared() {
    let p = serving(www_fs(), server(Satisfy::Any), |hooks| {
        hooks.check_access("allow", AuthScope::PerConf, Box::new(|_, _| Flow::Ok));
    });

    let mut r = p.new_request("GET", "/docs/page.html");
    r.user = Some("ghost".to_string());
    r.notes.insert(BASIC_AUTH_PW_NOTE.to_string(), "1".to_string());
    p.process(&mut r).unwrap();
    assert_eq!(r.user, None);

    // Without the tell-tale note the user is left alone.
    let mut r = p.new_request("GET", "/docs/page.html");
    r.user = Some("ghost".to_string());
    p.process(&mut r).unwrap();
    assert_eq!(r.user.as_deref(), Some("ghost"));
}

#[test]
fn matching_subrequest_inherits_authentication() {
    let authn = Arc::new(AtomicUsize::new(0));
    let authn_probe = Arc::clone(&authn);
    let p = serving(www_fs(), server(Satisfy::All), |hooks| {
        hooks.check_authn(
            "basic",
            AuthScope::PerConf,
            Box::new(move |_, r| {
                authn_probe.fetch_add(1, Ordering::Relaxed);
                r.user = Some("bob".to_string());
                r.auth_type = Some("Basic".to_string());
                Flow::Ok
            }),
        );
        hooks.check_authz("user-list", AuthScope::PerConf, Box::new(|_, _| Flow::Ok));
    });

    let mut parent = p.new_request("GET", "/docs/page.html");
    p.process(&mut parent).unwrap();
    assert_eq!(parent.user.as_deref(), Some("bob"));
    assert_eq!(authn.load(Ordering::Relaxed), 1);

    let child = p.lookup_uri("/docs/page.html", &parent, None);
    assert_eq!(child.status, StatusCode::OK);
    assert_eq!(child.user.as_deref(), Some("bob"));
    assert_eq!(child.auth_type.as_deref(), Some("Basic"));
    // The identical effective configuration means no authn hook ran.
    assert_eq!(authn.load(Ordering::Relaxed), 1);
}

#[test]
fn some_authn_required_probe() {
    let p = serving(www_fs(), server(Satisfy::All), |hooks| {
        hooks.check_authn("basic", AuthScope::PerConf, Box::new(|_, _| Flow::Declined));
    });
    let mut r = p.new_request("GET", "/docs/page.html");
    r.user = Some("carol".to_string());
    assert!(p.some_authn_required(&mut r));
    // The probe shields the principal.
    assert_eq!(r.user.as_deref(), Some("carol"));

    let p = serving(www_fs(), server(Satisfy::All), |hooks| {
        hooks.check_access_ex("authz-core", AuthScope::PerConf, Box::new(|_, _| Flow::Ok));
    });
    let mut r = p.new_request("GET", "/docs/page.html");
    assert!(!p.some_authn_required(&mut r));
}
