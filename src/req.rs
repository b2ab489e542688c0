use std::time::Duration;

use crate::api::ApiProblem;

pub(crate) type ReqResult<T> = std::result::Result<T, ApiProblem>;

pub(crate) type Response = std::result::Result<ureq::Response, ureq::Error>;

/// Blocking HTTP client shared by the directory, nonce pool and transport.
#[derive(Clone, Debug)]
pub(crate) struct HttpClient {
    agent: ureq::Agent,
}

impl HttpClient {
    pub fn new(user_agent: &str, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(timeout)
            .timeout_read(timeout)
            .timeout_write(timeout)
            .user_agent(user_agent)
            .build();
        HttpClient { agent }
    }

    pub fn get(&self, url: &str) -> Response {
        trace!("GET {}", url);
        self.agent.get(url).call()
    }

    pub fn head(&self, url: &str) -> Response {
        trace!("HEAD {}", url);
        self.agent.head(url).call()
    }

    pub fn post(&self, url: &str, body: &str) -> Response {
        trace!("POST {} {}", url, body);
        self.agent
            .post(url)
            .set("content-type", "application/jose+json")
            .send_string(body)
    }
}

/// The `Replay-Nonce` of a response, also when the response is an error status.
pub(crate) fn req_nonce(res: &Response) -> Option<String> {
    let r = match res {
        Ok(r) => r,
        Err(ureq::Error::Status(_, r)) => r,
        Err(_) => return None,
    };
    r.header("replay-nonce").map(|s| s.to_string())
}

pub(crate) fn req_handle_error(res: Response) -> ReqResult<ureq::Response> {
    match res {
        // ok responses pass through
        Ok(res) => Ok(res),

        Err(ureq::Error::Status(status, res)) => {
            let problem = if res.content_type() == "application/problem+json" {
                // if we were sent a problem+json, deserialize it
                let body = req_safe_read_body(res);
                serde_json::from_str(&body).unwrap_or_else(|e| {
                    ApiProblem::new(
                        "problemJsonFail",
                        format!(
                            "Failed to deserialize application/problem+json ({}) body: {}",
                            e, body
                        ),
                    )
                })
            } else {
                // some other problem
                let status_text = format!("{} {}", status, res.status_text());
                let body = req_safe_read_body(res);
                ApiProblem::new("httpReqError", format!("{} body: {}", status_text, body))
            };
            Err(ApiProblem {
                status: problem.status.or(Some(status)),
                ..problem
            })
        }

        Err(ureq::Error::Transport(t)) => Err(ApiProblem::new("httpTransport", t.to_string())),
    }
}

pub(crate) fn req_expect_header(res: &ureq::Response, name: &str) -> ReqResult<String> {
    res.header(name)
        .map(|s| s.to_string())
        .ok_or_else(|| ApiProblem::new("missingHeader", format!("Missing header: {}", name)))
}

/// URLs of all `Link` headers with the given `rel`.
pub(crate) fn req_links(res: &ureq::Response, rel: &str) -> Vec<String> {
    let want = format!("rel=\"{}\"", rel);
    res.all("link")
        .into_iter()
        .flat_map(|v| v.split(','))
        .filter_map(|link| {
            let mut parts = link.split(';').map(|p| p.trim());
            let url = parts.next()?;
            if !parts.any(|p| p == want || p == format!("rel={}", rel)) {
                return None;
            }
            let url = url.strip_prefix('<')?.strip_suffix('>')?;
            Some(url.to_string())
        })
        .collect()
}

pub(crate) fn req_safe_read_body(res: ureq::Response) -> String {
    use std::io::Read;
    let mut res_body = String::new();
    let mut read = res.into_reader();
    // letsencrypt sometimes closes the TLS abruptly causing io error
    // even though we did capture the body.
    read.read_to_string(&mut res_body).ok();
    res_body
}
