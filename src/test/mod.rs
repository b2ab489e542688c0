//! A small stateful ACME CA for tests.
//!
//! Requests are not signature checked, but the account key is taken from the JWS so key
//! authorizations can be verified against what a test "published".
#![allow(clippy::trivial_regex)]

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server};
use lazy_static::lazy_static;
use openssl::x509::X509Req;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::TcpListener;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::sync::oneshot;

use crate::api::{ApiIdentifier, ApiRevocation};
use crate::cert::test::TestCa;
use crate::challenge::Provider;
use crate::jwt::Jwk;
use crate::util::base64url_decode;

/// Common name of the root of the alternate chain offered for every certificate.
pub const ALT_ROOT_CN: &str = "Keeper Alternate Root";

const ROOT_CN: &str = "Keeper Test Root";

lazy_static! {
    static ref RE_URL: regex::Regex = regex::Regex::new("<URL>").unwrap();
    static ref RE_EAB: regex::Regex = regex::Regex::new("<EAB>").unwrap();
}

/// What the CA knows, open to tests for setup and inspection.
#[derive(Default)]
pub struct CaState {
    /// Advertise `externalAccountRequired` and refuse accounts without binding.
    pub require_eab: bool,
    /// New authorizations start out valid.
    pub preauthorized: bool,
    /// Triggered authorizations never leave `pending`.
    pub stuck_pending: bool,
    /// New orders start out `invalid` with a `rejectedIdentifier` problem.
    pub reject_orders: bool,
    /// Finalized orders turn `invalid` with a `badCSR` problem instead of issuing.
    pub reject_finalize: bool,
    /// Answer this many POSTs with `badNonce` before serving them.
    pub bad_nonces: usize,
    /// Suggested renewal window, `None` makes the renewal info endpoint fail.
    pub ari_window: Option<(OffsetDateTime, OffsetDateTime)>,
    pub accounts_created: usize,
    pub orders_created: usize,
    /// `replaces` of every new order.
    pub replaces: Vec<String>,
    /// Reason codes of revocations.
    pub revocations: Vec<u8>,
    accounts: Vec<MockAccount>,
    orders: Vec<MockOrder>,
    authzs: Vec<MockAuthz>,
    certs: Vec<(String, String)>,
    nonce: u64,
}

struct MockAccount {
    jwk: Jwk,
    thumbprint: String,
    contact: Vec<String>,
}

struct MockOrder {
    identifiers: Vec<ApiIdentifier>,
    authzs: Vec<usize>,
    cert: Option<usize>,
    error: Option<Value>,
}

struct MockAuthz {
    identifier: ApiIdentifier,
    wildcard: bool,
    token: String,
    account: usize,
    status: &'static str,
    triggered: Option<String>,
    // polls answered "pending" after the challenge was triggered.
    grace: usize,
    error: Option<Value>,
}

pub struct TestServer {
    pub dir_url: String,
    ca: Arc<MockCa>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl TestServer {
    pub fn ca(&self) -> MutexGuard<'_, CaState> {
        self.ca.state.lock().unwrap()
    }

    /// Challenge responses visible to the CA, token to key authorization.
    pub fn published(&self) -> &Arc<Mutex<HashMap<String, String>>> {
        &self.ca.published
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            tx.send(()).ok();
        }
    }
}

struct MockCa {
    url: String,
    state: Mutex<CaState>,
    published: Arc<Mutex<HashMap<String, String>>>,
    root: TestCa,
    alt_root: TestCa,
}

struct Signed {
    protected: Value,
    payload: Option<Value>,
}

fn parse_jws(body: &[u8]) -> Option<Signed> {
    let jws: Value = serde_json::from_slice(body).ok()?;
    let protected = base64url_decode(jws["protected"].as_str()?).ok()?;
    let protected: Value = serde_json::from_slice(&protected).ok()?;
    let payload = jws["payload"].as_str()?;
    let payload = if payload.is_empty() {
        None
    } else {
        let bytes = base64url_decode(payload).ok()?;
        Some(serde_json::from_slice(&bytes).ok()?)
    };
    Some(Signed { protected, payload })
}

fn json_response<T: Serialize>(status: u16, body: &T) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Body::from(serde_json::to_vec(body).unwrap()))
        .unwrap()
}

fn problem(status: u16, kind: &str, detail: &str) -> Response<Body> {
    let body = json!({
        "type": format!("urn:ietf:params:acme:error:{}", kind),
        "detail": detail,
        "status": status,
    });
    Response::builder()
        .status(status)
        .header("Content-Type", "application/problem+json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn empty(status: u16) -> Response<Body> {
    Response::builder().status(status).body(Body::empty()).unwrap()
}

fn get_directory(url: &str, require_eab: bool) -> Response<Body> {
    const BODY: &str = r#"{
    "keyChange": "<URL>/acme/key-change",
    "newAccount": "<URL>/acme/new-acct",
    "newNonce": "<URL>/acme/new-nonce",
    "newOrder": "<URL>/acme/new-order",
    "revokeCert": "<URL>/acme/revoke-cert",
    "renewalInfo": "<URL>/acme/renewal-info",
    "meta": {
        "caaIdentities": [
        "testdir.org"
        ],
        "externalAccountRequired": <EAB>
    }
    }"#;
    let body = RE_URL.replace_all(BODY, url);
    let body = RE_EAB.replace_all(&body, if require_eab { "true" } else { "false" });
    Response::new(Body::from(body.into_owned()))
}

fn trailing_index(s: &str) -> Option<usize> {
    s.rsplit('/').next()?.parse().ok()
}

impl MockCa {
    fn route(&self, method: &Method, path: &str, body: &[u8]) -> Response<Body> {
        let segments: Vec<&str> = path.trim_start_matches('/').split('/').collect();

        if *method == Method::POST {
            let mut state = self.state.lock().unwrap();
            if state.bad_nonces > 0 {
                state.bad_nonces -= 1;
                return problem(400, "badNonce", "JWS has an invalid anti-replay nonce");
            }
        }

        match (method, segments.as_slice()) {
            (&Method::GET, ["directory"]) => {
                get_directory(&self.url, self.state.lock().unwrap().require_eab)
            }
            (&Method::HEAD, ["acme", "new-nonce"]) => empty(200),
            (&Method::GET, ["acme", "new-nonce"]) => empty(204),
            (&Method::GET, ["acme", "renewal-info", _]) => self.get_renewal_info(),
            (&Method::POST, ["acme", rest @ ..]) => {
                let signed = match parse_jws(body) {
                    Some(s) => s,
                    None => return problem(400, "malformed", "not a JWS"),
                };
                match rest {
                    ["new-acct"] => self.post_new_acct(&signed),
                    ["new-order"] => self.post_new_order(&signed),
                    ["order", n] => self.post_order(n),
                    ["authz", n] => self.post_authz(n),
                    ["chall", n, kind] => self.post_challenge(n, kind),
                    ["finalize", n] => self.post_finalize(n, &signed),
                    ["cert", n] => self.post_certificate(n, false),
                    ["cert", n, "1"] => self.post_certificate(n, true),
                    ["revoke-cert"] => self.post_revoke(&signed),
                    _ => empty(404),
                }
            }
            _ => empty(404),
        }
    }

    fn account_of(&self, state: &CaState, signed: &Signed) -> Option<usize> {
        let kid = signed.protected["kid"].as_str()?;
        trailing_index(kid).filter(|i| *i < state.accounts.len())
    }

    fn post_new_acct(&self, signed: &Signed) -> Response<Body> {
        let jwk: Jwk = match serde_json::from_value(signed.protected["jwk"].clone()) {
            Ok(j) => j,
            Err(_) => return problem(400, "malformed", "newAccount needs a jwk"),
        };
        let payload = signed.payload.clone().unwrap_or(Value::Null);
        let mut state = self.state.lock().unwrap();

        let existing = state.accounts.iter().position(|a| a.jwk == jwk);
        let (idx, status) = match existing {
            Some(idx) => (idx, 200),
            None => {
                if payload["onlyReturnExisting"].as_bool() == Some(true) {
                    return problem(400, "accountDoesNotExist", "no account for this key");
                }
                if state.require_eab && payload["externalAccountBinding"].is_null() {
                    return problem(400, "externalAccountRequired", "eab required");
                }
                let contact = payload["contact"]
                    .as_array()
                    .map(|a| {
                        a.iter()
                            .filter_map(|c| c.as_str().map(|s| s.to_string()))
                            .collect()
                    })
                    .unwrap_or_default();
                let thumbprint = jwk.thumbprint().unwrap();
                state.accounts.push(MockAccount {
                    jwk,
                    thumbprint,
                    contact,
                });
                state.accounts_created += 1;
                (state.accounts.len() - 1, 201)
            }
        };

        let body = json!({
            "status": "valid",
            "contact": state.accounts[idx].contact,
            "orders": format!("{}/acme/orders/{}", self.url, idx),
        });
        let mut res = json_response(status, &body);
        res.headers_mut().insert(
            "location",
            format!("{}/acme/acct/{}", self.url, idx).parse().unwrap(),
        );
        res
    }

    fn post_new_order(&self, signed: &Signed) -> Response<Body> {
        let payload = signed.payload.clone().unwrap_or(Value::Null);
        let identifiers: Vec<ApiIdentifier> =
            match serde_json::from_value(payload["identifiers"].clone()) {
                Ok(ids) => ids,
                Err(_) => return problem(400, "malformed", "no identifiers"),
            };
        let mut state = self.state.lock().unwrap();
        let account = match self.account_of(&state, signed) {
            Some(a) => a,
            None => return problem(400, "accountDoesNotExist", "unknown kid"),
        };
        if let Some(r) = payload["replaces"].as_str() {
            state.replaces.push(r.to_string());
        }

        let initial = if state.preauthorized { "valid" } else { "pending" };
        let mut authzs = vec![];
        for id in &identifiers {
            let wildcard = id.value.starts_with("*.");
            let identifier = ApiIdentifier {
                _type: id._type.clone(),
                value: id.value.trim_start_matches("*.").to_string(),
            };
            let token = format!("tok{}x{}", state.authzs.len(), state.nonce);
            state.authzs.push(MockAuthz {
                identifier,
                wildcard,
                token,
                account,
                status: initial,
                triggered: None,
                grace: 0,
                error: None,
            });
            authzs.push(state.authzs.len() - 1);
        }
        state.orders.push(MockOrder {
            identifiers,
            authzs,
            cert: None,
            error: None,
        });
        if state.reject_orders {
            state.orders.last_mut().unwrap().error = Some(json!({
                "type": "urn:ietf:params:acme:error:rejectedIdentifier",
                "detail": "policy forbids issuing for this name",
                "status": 400,
            }));
        }
        state.orders_created += 1;
        let idx = state.orders.len() - 1;

        let mut res = json_response(201, &self.order_json(&state, idx));
        res.headers_mut().insert(
            "location",
            format!("{}/acme/order/{}", self.url, idx).parse().unwrap(),
        );
        res
    }

    fn order_status(&self, state: &CaState, order: &MockOrder) -> &'static str {
        if order.cert.is_some() {
            return "valid";
        }
        if order.error.is_some() {
            return "invalid";
        }
        let statuses: Vec<&str> = order.authzs.iter().map(|a| state.authzs[*a].status).collect();
        if statuses.iter().any(|s| *s == "invalid") {
            "invalid"
        } else if statuses.iter().all(|s| *s == "valid") {
            "ready"
        } else {
            "pending"
        }
    }

    fn order_json(&self, state: &CaState, idx: usize) -> Value {
        let order = &state.orders[idx];
        let mut body = json!({
            "status": self.order_status(state, order),
            "expires": "2030-01-09T08:26:43Z",
            "identifiers": order.identifiers,
            "authorizations": order
                .authzs
                .iter()
                .map(|a| format!("{}/acme/authz/{}", self.url, a))
                .collect::<Vec<_>>(),
            "finalize": format!("{}/acme/finalize/{}", self.url, idx),
        });
        if let Some(cert) = order.cert {
            body["certificate"] = json!(format!("{}/acme/cert/{}", self.url, cert));
        }
        let authz_error = order
            .authzs
            .iter()
            .find_map(|a| state.authzs[*a].error.as_ref());
        if let Some(e) = order.error.as_ref().or(authz_error) {
            body["error"] = e.clone();
        }
        body
    }

    fn post_order(&self, n: &str) -> Response<Body> {
        let state = self.state.lock().unwrap();
        match n.parse::<usize>().ok().filter(|i| *i < state.orders.len()) {
            Some(idx) => json_response(200, &self.order_json(&state, idx)),
            None => empty(404),
        }
    }

    /// Decide a triggered authorization once its grace polls are used up.
    fn settle(&self, state: &mut CaState, idx: usize) {
        let published = self.published.lock().unwrap();
        let thumbprint = state.accounts[state.authzs[idx].account].thumbprint.clone();
        let stuck = state.stuck_pending;
        let authz = &mut state.authzs[idx];
        if authz.status != "pending" || authz.triggered.is_none() || stuck {
            return;
        }
        if authz.grace > 0 {
            authz.grace -= 1;
            return;
        }
        let expected = format!("{}.{}", authz.token, thumbprint);
        if published.get(&authz.token) == Some(&expected) {
            authz.status = "valid";
        } else {
            authz.status = "invalid";
            authz.error = Some(json!({
                "type": "urn:ietf:params:acme:error:unauthorized",
                "detail": format!("no key authorization found for {}", authz.identifier.value),
                "status": 403,
            }));
        }
    }

    fn authz_json(&self, state: &CaState, idx: usize) -> Value {
        let authz = &state.authzs[idx];
        let kinds: &[&str] = if authz.wildcard {
            &["dns-01"]
        } else {
            &["http-01", "tls-alpn-01", "dns-01"]
        };
        let challenges: Vec<Value> = kinds
            .iter()
            .map(|kind| {
                let status = match (authz.status, &authz.triggered) {
                    ("pending", Some(t)) if t == kind => "processing",
                    ("pending", _) => "pending",
                    (s, Some(t)) if t == kind => s,
                    ("valid", None) => "valid",
                    _ => "pending",
                };
                let mut c = json!({
                    "type": kind,
                    "status": status,
                    "url": format!("{}/acme/chall/{}/{}", self.url, idx, kind),
                    "token": authz.token,
                });
                if authz.triggered.as_deref() == Some(*kind) {
                    if let Some(e) = &authz.error {
                        c["error"] = e.clone();
                    }
                }
                c
            })
            .collect();
        let mut body = json!({
            "identifier": authz.identifier,
            "status": authz.status,
            "expires": "2030-01-09T08:26:43Z",
            "challenges": challenges,
        });
        if authz.wildcard {
            body["wildcard"] = json!(true);
        }
        body
    }

    fn post_authz(&self, n: &str) -> Response<Body> {
        let mut state = self.state.lock().unwrap();
        let idx = match n.parse::<usize>().ok().filter(|i| *i < state.authzs.len()) {
            Some(i) => i,
            None => return empty(404),
        };
        self.settle(&mut state, idx);
        json_response(200, &self.authz_json(&state, idx))
    }

    fn post_challenge(&self, n: &str, kind: &str) -> Response<Body> {
        let mut state = self.state.lock().unwrap();
        let idx = match n.parse::<usize>().ok().filter(|i| *i < state.authzs.len()) {
            Some(i) => i,
            None => return empty(404),
        };
        {
            let authz = &mut state.authzs[idx];
            if authz.status == "pending" && authz.triggered.is_none() {
                authz.triggered = Some(kind.to_string());
                authz.grace = 1;
            }
        }
        let body = self.authz_json(&state, idx);
        let challenge = body["challenges"]
            .as_array()
            .and_then(|cs| cs.iter().find(|c| c["type"] == kind))
            .cloned();
        match challenge {
            Some(c) => json_response(200, &c),
            None => empty(404),
        }
    }

    fn post_finalize(&self, n: &str, signed: &Signed) -> Response<Body> {
        let mut state = self.state.lock().unwrap();
        let idx = match n.parse::<usize>().ok().filter(|i| *i < state.orders.len()) {
            Some(i) => i,
            None => return empty(404),
        };
        if self.order_status(&state, &state.orders[idx]) != "ready" {
            return problem(403, "orderNotReady", "order is not ready");
        }
        let csr = signed
            .payload
            .as_ref()
            .and_then(|p| p["csr"].as_str())
            .and_then(|c| base64url_decode(c).ok())
            .and_then(|der| X509Req::from_der(&der).ok());
        let csr = match csr {
            Some(c) => c,
            None => return problem(400, "badCSR", "unreadable CSR"),
        };
        if state.reject_finalize {
            state.orders[idx].error = Some(json!({
                "type": "urn:ietf:params:acme:error:badCSR",
                "detail": "key is on the blocklist",
                "status": 400,
            }));
            let mut body = self.order_json(&state, idx);
            body["status"] = json!("processing");
            return json_response(200, &body);
        }
        let pubkey = csr.public_key().unwrap();
        let domains: Vec<String> = state.orders[idx]
            .identifiers
            .iter()
            .map(|i| i.value.clone())
            .collect();
        let now = OffsetDateTime::now_utc();
        let leaf = self
            .root
            .issue(&pubkey, &domains, now - time::Duration::hours(1), now + time::Duration::days(90))
            .unwrap();
        let leaf = String::from_utf8(leaf.to_pem().unwrap()).unwrap();
        let default_chain = format!(
            "{}{}",
            leaf,
            String::from_utf8(self.root.cert.to_pem().unwrap()).unwrap()
        );
        let alt_chain = format!(
            "{}{}",
            leaf,
            String::from_utf8(self.alt_root.cert.to_pem().unwrap()).unwrap()
        );
        state.certs.push((default_chain, alt_chain));
        state.orders[idx].cert = Some(state.certs.len() - 1);

        let mut body = self.order_json(&state, idx);
        // the client is expected to poll for the final state.
        body["status"] = json!("processing");
        json_response(200, &body)
    }

    fn post_certificate(&self, n: &str, alternate: bool) -> Response<Body> {
        let state = self.state.lock().unwrap();
        let idx = match n.parse::<usize>().ok().filter(|i| *i < state.certs.len()) {
            Some(i) => i,
            None => return empty(404),
        };
        let (default_chain, alt_chain) = &state.certs[idx];
        let pem = if alternate { alt_chain } else { default_chain };
        let mut res = Response::builder()
            .status(200)
            .header("Content-Type", "application/pem-certificate-chain");
        if !alternate {
            res = res.header(
                "Link",
                format!("<{}/acme/cert/{}/1>;rel=\"alternate\"", self.url, idx),
            );
        }
        res.body(Body::from(pem.clone())).unwrap()
    }

    fn post_revoke(&self, signed: &Signed) -> Response<Body> {
        let revocation: ApiRevocation = match signed
            .payload
            .clone()
            .and_then(|p| serde_json::from_value(p).ok())
        {
            Some(r) => r,
            None => return problem(400, "malformed", "bad revocation request"),
        };
        if revocation.reason == 7 || revocation.reason > 10 {
            return problem(400, "badRevocationReason", "unsupported reason");
        }
        self.state.lock().unwrap().revocations.push(revocation.reason);
        empty(200)
    }

    fn get_renewal_info(&self) -> Response<Body> {
        let window = self.state.lock().unwrap().ari_window;
        match window {
            Some((start, end)) => {
                let body = json!({
                    "suggestedWindow": {
                        "start": start.format(&Rfc3339).unwrap(),
                        "end": end.format(&Rfc3339).unwrap(),
                    }
                });
                json_response(200, &body)
            }
            None => problem(500, "serverInternal", "renewal info unavailable"),
        }
    }

    fn next_nonce(&self) -> String {
        let mut state = self.state.lock().unwrap();
        state.nonce += 1;
        format!("nonce-{}", state.nonce)
    }
}

async fn handle(ca: Arc<MockCa>, req: Request<Body>) -> Result<Response<Body>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let body = hyper::body::to_bytes(req.into_body())
        .await
        .unwrap_or_default();
    let mut res = ca.route(&method, &path, &body);
    res.headers_mut()
        .insert("replay-nonce", ca.next_nonce().parse().unwrap());
    Ok(res)
}

pub fn with_directory_server() -> TestServer {
    let _ = env_logger::builder().is_test(true).try_init();

    let tcp = TcpListener::bind("127.0.0.1:0").unwrap();
    tcp.set_nonblocking(true).unwrap();
    let port = tcp.local_addr().unwrap().port();

    let url = format!("http://127.0.0.1:{}", port);
    let dir_url = format!("{}/directory", url);

    let ca = Arc::new(MockCa {
        url,
        state: Mutex::new(CaState::default()),
        published: Arc::new(Mutex::new(HashMap::new())),
        root: TestCa::new(ROOT_CN).unwrap(),
        alt_root: TestCa::new(ALT_ROOT_CN).unwrap(),
    });

    let (tx, rx) = oneshot::channel::<()>();

    let server_ca = ca.clone();
    thread::spawn(move || {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async move {
            let make_service = make_service_fn(move |_| {
                let ca = server_ca.clone();
                async move {
                    Ok::<_, Infallible>(service_fn(move |req| handle(ca.clone(), req)))
                }
            });
            let server = Server::from_tcp(tcp).unwrap().serve(make_service);
            let graceful = server.with_graceful_shutdown(async {
                rx.await.ok();
            });
            if let Err(e) = graceful.await {
                eprintln!("server error: {}", e);
            }
        });
    });

    TestServer {
        dir_url,
        ca,
        shutdown: Some(tx),
    }
}

/// Publishes key authorizations where the mock CA looks for them, after a delay.
pub struct PublishingProvider {
    published: Arc<Mutex<HashMap<String, String>>>,
    delay: Duration,
    pub calls: Mutex<Vec<String>>,
}

impl PublishingProvider {
    pub fn new(server: &TestServer, delay: Duration) -> Self {
        PublishingProvider {
            published: server.published().clone(),
            delay,
            calls: Mutex::new(vec![]),
        }
    }
}

impl Provider for PublishingProvider {
    fn present(&self, domain: &str, token: &str, key_auth: &str) -> crate::Result<()> {
        thread::sleep(self.delay);
        self.published
            .lock()
            .unwrap()
            .insert(token.to_string(), key_auth.to_string());
        self.calls.lock().unwrap().push(format!("present {}", domain));
        Ok(())
    }

    fn clean_up(&self, domain: &str, token: &str, _key_auth: &str) -> crate::Result<()> {
        self.published.lock().unwrap().remove(token);
        self.calls.lock().unwrap().push(format!("cleanup {}", domain));
        Ok(())
    }
}

#[test]
pub fn test_make_directory() {
    let server = with_directory_server();
    let res = ureq::get(&server.dir_url).call();
    assert!(res.is_ok());
}
