use super::*;
use assert_matches::assert_matches;
use std::net::Ipv4Addr;

const HOUR: Duration = Duration::from_secs(3600);

#[test]
fn test_unix_credentials() {
    let auth = UnixAuthenticator;

    let id = auth.authenticate(b"unix\0alice staff", "data01").unwrap();
    assert_eq!(id.protocol, "unix");
    assert_eq!(id.name, "alice");
    assert_eq!(id.groups.as_deref(), Some("staff"));
    assert_eq!(id.host, "data01");

    let id = auth.authenticate(b"unix\0bob", "data01").unwrap();
    assert_eq!(id.name, "bob");
    assert_eq!(id.groups, None);
}

#[test]
fn test_short_credentials_use_host_protocol() {
    let id = UnixAuthenticator.authenticate(b"", "data01").unwrap();
    assert_eq!(id.protocol, "host");
    assert_eq!(id.name, "?");
}

#[test]
fn test_protocol_mismatch_is_fatal() {
    let err = UnixAuthenticator
        .authenticate(b"krb5\0alice", "data01")
        .unwrap_err();
    assert_matches!(&err, AuthError::ProtocolMismatch { actual, .. } if actual == "krb5");
    assert!(err.is_fatal());

    let err = UnixAuthenticator.authenticate(b"unix\0", "data01").unwrap_err();
    assert_matches!(err, AuthError::Malformed(_));
    assert!(!err.is_fatal());
}

#[test]
fn test_empty_allow_list_allows_everyone() {
    let auth = HostAuthorizer::new::<&str>(&[], HOUR);
    assert!(auth.authorize("anything", None).is_ok());
}

#[test]
fn test_patterns_and_cache() {
    let auth = HostAuthorizer::new(&["data*.example.org", "mgr.example.org"], HOUR);
    let addr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));

    assert!(auth.authorize("data01.example.org", Some(addr)).is_ok());
    assert_eq!(auth.cached(), 1);
    assert!(auth.authorize("DATA01.example.org", None).is_ok());
    assert_matches!(
        auth.authorize("evil.example.com", Some(addr)),
        Err(AuthError::HostNotAuthorized(h)) if h == "evil.example.com"
    );
    assert_eq!(auth.cached(), 0);
}

#[test]
fn test_cache_expires() {
    let auth = HostAuthorizer::new(&["data01"], Duration::ZERO);
    let addr = IpAddr::V4(Ipv4Addr::LOCALHOST);
    assert!(auth.authorize("data01", Some(addr)).is_ok());
    assert!(auth.authorize("data01", Some(addr)).is_ok());
    assert_eq!(auth.cached(), 1);
}

#[test]
fn test_merge() {
    let mut auth = HostAuthorizer::new(&["data*"], HOUR);
    auth.merge(HostAuthorizer::new(&["mgr", "data*"], Duration::from_secs(60)));

    assert!(auth.authorize("mgr", None).is_ok());
    assert!(auth.authorize("data07", None).is_ok());
    assert!(auth.authorize("proxy", None).is_err());
}

#[test]
fn test_login_is_checked_against_peer() {
    let auth = HostAuthorizer::new(&["data*"], HOUR);
    let addr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9));

    assert_matches!(
        auth.authorize_login("data01", "evil.example.org", Some(addr)),
        Err(AuthError::HostNotAuthorized(h)) if h == "evil.example.org"
    );
    assert_eq!(auth.cached(), 0);
    assert_matches!(
        auth.authorize_login("data01", "data02", None),
        Err(AuthError::HostNotAuthorized(h)) if h == "data01"
    );
    assert!(auth.authorize_login("DATA01", "data01", Some(addr)).is_ok());

    let open = HostAuthorizer::new::<&str>(&[], HOUR);
    assert!(open.authorize_login("data01", "10.0.0.9", None).is_ok());
}
