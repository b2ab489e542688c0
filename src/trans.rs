use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use crate::acc::AcmeKey;
use crate::jwt::*;
use crate::req::{req_expect_header, req_handle_error, req_nonce, HttpClient};
use crate::Result;

/// How many times a request is replayed after the server rejected its nonce.
const MAX_BAD_NONCE_RETRIES: usize = 5;

/// JWS payload and nonce handling for requests to the API.
///
/// Setup is:
///
/// 1. `Transport::new()`
/// 2. `call_jwk()` against newAccount url
/// 3. `set_key_id` from the returned `Location` header.
/// 4. `call()` for all calls after that.
#[derive(Clone)]
pub(crate) struct Transport {
    acme_key: AcmeKey,
    client: HttpClient,
    nonce_pool: Arc<NoncePool>,
}

impl Transport {
    pub fn new(nonce_pool: &Arc<NoncePool>, client: HttpClient, acme_key: AcmeKey) -> Self {
        Transport {
            acme_key,
            client,
            nonce_pool: nonce_pool.clone(),
        }
    }

    /// Update the key id once it is known (part of setting up the transport).
    pub fn set_key_id(&mut self, kid: String) {
        self.acme_key.set_key_id(kid);
    }

    /// The key used in the transport
    pub fn acme_key(&self) -> &AcmeKey {
        &self.acme_key
    }

    /// The plain http client, for unauthenticated GETs.
    pub fn client(&self) -> &HttpClient {
        &self.client
    }

    /// Make call using the full jwk. Only for the first newAccount request.
    pub fn call_jwk<T: Serialize + ?Sized>(&self, url: &str, body: &T) -> Result<ureq::Response> {
        self.do_call(url, body, jws_with_jwk)
    }

    /// Make call using the key id
    pub fn call<T: Serialize + ?Sized>(&self, url: &str, body: &T) -> Result<ureq::Response> {
        self.do_call(url, body, jws_with_kid)
    }

    fn do_call<T: Serialize + ?Sized, F: Fn(&str, String, &AcmeKey, &T) -> Result<String>>(
        &self,
        url: &str,
        body: &T,
        make_body: F,
    ) -> Result<ureq::Response> {
        // The ACME API may at any point invalidate all nonces. If we detect such an
        // error, we retry a bounded number of times with a fresh nonce.
        let mut attempt = 0;
        loop {
            attempt += 1;

            // Either get a new nonce, or reuse one from a previous request.
            let nonce = self.nonce_pool.get_nonce()?;

            // Sign the body.
            let body = make_body(url, nonce, &self.acme_key, body)?;

            debug!("Call endpoint {}", url);

            // Post it to the URL
            let response = self.client.post(url, &body);

            // Regardless of the request being a success or not, there might be
            // a nonce in the response.
            self.nonce_pool.extract_nonce(&response);

            // Turn errors into ApiProblem.
            let result = req_handle_error(response);

            if let Err(problem) = &result {
                if problem.is_bad_nonce() && attempt <= MAX_BAD_NONCE_RETRIES {
                    // retry the request with a new nonce.
                    debug!("Retrying on bad nonce ({})", attempt);
                    continue;
                }
            }

            return Ok(result?);
        }
    }
}

/// Shared pool of nonces.
#[derive(Debug)]
pub(crate) struct NoncePool {
    nonce_url: String,
    client: HttpClient,
    pool: Mutex<VecDeque<String>>,
}

impl NoncePool {
    pub fn new(client: HttpClient, nonce_url: &str) -> Self {
        NoncePool {
            nonce_url: nonce_url.into(),
            client,
            pool: Default::default(),
        }
    }

    fn extract_nonce(&self, res: &crate::req::Response) {
        if let Some(nonce) = req_nonce(res) {
            trace!("Extract nonce");
            let mut pool = self.pool.lock().unwrap_or_else(PoisonError::into_inner);
            pool.push_back(nonce);
            if pool.len() > 10 {
                pool.pop_front();
            }
        }
    }

    fn get_nonce(&self) -> Result<String> {
        {
            let mut pool = self.pool.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(nonce) = pool.pop_front() {
                trace!("Use previous nonce");
                return Ok(nonce);
            }
        }
        debug!("Request new nonce");
        let res = req_handle_error(self.client.head(&self.nonce_url))?;
        Ok(req_expect_header(&res, "replay-nonce")?)
    }
}
