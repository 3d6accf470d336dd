use axum::http::{HeaderMap, Method, StatusCode};
use axum::http::header::{CONNECTION, CONTENT_LENGTH, HOST};
use bytes::Bytes;
use log::{debug, warn};
use serde_json::{Map, Value};
use super::FleetProxy;

pub const FAILED: &str = "Connection to tracers failed";

#[derive(Clone, Debug)]
pub struct Forward {
    pub method:  Method,
    pub path:    String,
    pub headers: HeaderMap,
    pub body:    Bytes,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Reply {
    pub status: StatusCode,
    pub body:   Bytes,
}

/// Merges node answers: any 200 wins, otherwise the last error seen.
#[derive(Debug)]
pub struct Aggregate {
    status: StatusCode,
    merged: Map<String, Value>,
    error:  Bytes,
}

impl Default for Aggregate {
    fn default() -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            merged: Map::new(),
            error:  Bytes::from(Value::from(FAILED).to_string()),
        }
    }
}

impl Aggregate {
    pub fn push(&mut self, status: StatusCode, body: &[u8]) -> bool {
        if status == StatusCode::OK {
            self.status = status;
            match serde_json::from_slice::<Map<String, Value>>(body) {
                Ok(map) => self.merged.extend(map),
                Err(e)  => debug!("ignoring non-object answer: {}", e),
            }
            return true;
        }

        if self.status != StatusCode::OK {
            self.status = status;
            self.error  = Bytes::copy_from_slice(body);
        }

        false
    }

    pub fn finish(self) -> Reply {
        match self.status {
            StatusCode::OK => Reply {
                status: StatusCode::OK,
                body:   Bytes::from(Value::Object(self.merged).to_string()),
            },
            status => Reply {
                status: status,
                body:   self.error,
            },
        }
    }
}

impl FleetProxy {
    pub async fn proxy(&self, req: Forward, any: bool) -> Reply {
        let mut agg = Aggregate::default();

        for (name, target, client) in self.runnable().await {
            let url = match target.join(&req.path) {
                Ok(url) => url,
                Err(e)  => {
                    warn!("invalid path {} for {}: {}", req.path, name, e);
                    continue;
                }
            };

            let mut builder = client.request(req.method.clone(), url).body(req.body.clone());
            for (key, value) in &req.headers {
                if key != HOST && key != CONTENT_LENGTH && key != CONNECTION {
                    builder = builder.header(key, value);
                }
            }

            let res = match builder.send().await {
                Ok(res) => res,
                Err(e)  => {
                    warn!("forward to {} failed: {}", name, e);
                    continue;
                }
            };

            let status = res.status();
            let body   = match res.bytes().await {
                Ok(body) => body,
                Err(e)   => {
                    warn!("reading answer of {} failed: {}", name, e);
                    continue;
                }
            };

            debug!("forward {} {} to {}: {}", req.method, req.path, target, status);

            if agg.push(status, &body) && any {
                break;
            }
        }

        agg.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ERROR: StatusCode = StatusCode::INTERNAL_SERVER_ERROR;

    fn json(reply: &Reply) -> Value {
        serde_json::from_slice(&reply.body).unwrap()
    }

    #[test]
    fn merges_successful_objects() {
        let mut agg = Aggregate::default();
        assert!(agg.push(StatusCode::OK, br#"{"a":1}"#));
        assert!(!agg.push(ERROR, b"\"err\""));
        assert!(agg.push(StatusCode::OK, br#"{"b":2}"#));

        let reply = agg.finish();
        assert_eq!(reply.status, StatusCode::OK);
        assert_eq!(json(&reply), serde_json::json!({"a": 1, "b": 2}));
    }

    #[test]
    fn last_writer_wins_on_duplicate_keys() {
        let mut agg = Aggregate::default();
        agg.push(StatusCode::OK, br#"{"a":1,"b":1}"#);
        agg.push(StatusCode::OK, br#"{"a":2}"#);
        assert_eq!(json(&agg.finish()), serde_json::json!({"a": 2, "b": 1}));
    }

    #[test]
    fn keeps_last_error_until_success() {
        let mut agg = Aggregate::default();
        agg.push(StatusCode::NOT_FOUND, b"\"first\"");
        agg.push(ERROR, b"\"second\"");

        let reply = agg.finish();
        assert_eq!(reply.status, ERROR);
        assert_eq!(reply.body, Bytes::from_static(b"\"second\""));

        let mut agg = Aggregate::default();
        agg.push(StatusCode::OK, br#"{"a":1}"#);
        agg.push(ERROR, b"\"late\"");
        assert_eq!(agg.finish().status, StatusCode::OK);
    }

    #[test]
    fn no_answers_is_a_failure() {
        let reply = Aggregate::default().finish();
        assert_eq!(reply.status, ERROR);
        assert_eq!(json(&reply), Value::from(FAILED));
    }
}
