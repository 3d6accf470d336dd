use std::convert::TryInto;
use std::io::Write;
use std::time::Duration;
use anyhow::{Context, Result};
use base64::{STANDARD, write::EncoderStringWriter};
use log::debug;
use reqwest::{Client as HttpClient, Method, Request, Url};
use reqwest::header::{self, HeaderMap, HeaderValue};
use super::{Args, Span};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct HttpExporter {
    client:   HttpClient,
    endpoint: Url,
}

impl HttpExporter {
    pub fn new(args: Args) -> Result<Self> {
        let endpoint = args.get("endpoint")?;
        let username = args.opt("username");
        let password = args.opt("password");
        let timeout  = match args.opt("timeout") {
            Some(secs) => Duration::from_secs(secs.parse().context("invalid timeout")?),
            None       => DEFAULT_TIMEOUT,
        };

        let endpoint = Url::parse(endpoint)?;

        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, "application/json".try_into()?);
        headers.insert(header::USER_AGENT, env!("CARGO_PKG_NAME").try_into()?);

        if let Some((username, password)) = username.zip(password) {
            let mut buf = "Basic ".to_string();
            let mut enc = EncoderStringWriter::from(&mut buf, STANDARD);
            write!(enc, "{}:{}", username, password)?;
            let mut value = HeaderValue::from_str(&enc.into_inner())?;
            value.set_sensitive(true);
            headers.insert(header::AUTHORIZATION, value);
        }

        let client = HttpClient::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()?;

        Ok(Self { client, endpoint })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub async fn send(&self, span: &Span) -> Result<()> {
        let endpoint = self.endpoint.clone();
        let mut req  = Request::new(Method::POST, endpoint);
        *req.body_mut() = Some(serde_json::to_vec(&[span])?.into());

        let res = self.client.execute(req).await?.error_for_status()?;
        debug!("exported span {}: {}", span.name, res.status());

        Ok(())
    }
}
