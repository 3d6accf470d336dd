use std::str::FromStr;
use anyhow::{Error, Result, anyhow};
use log::{debug, info};
use super::{Args, HttpExporter, Span};

pub enum Sink {
    Http(HttpExporter),
    Log,
}

impl Sink {
    pub async fn export(&self, span: Span) -> Result<()> {
        match self {
            Self::Http(c) => c.send(&span).await?,
            Self::Log     => print(&span),
        }
        Ok(())
    }
}

impl Default for Sink {
    fn default() -> Self {
        Self::Log
    }
}

impl FromStr for Sink {
   type Err = Error;

    fn from_str(arg: &str) -> Result<Self, Self::Err> {
        match Args::parse(arg)? {
            ("http", args) => http(args),
            ("log", _args) => Ok(Self::Log),
            _              => Err(anyhow!("invalid sink: {}", arg)),
        }
    }
}

fn http(args: Args) -> Result<Sink> {
    Ok(Sink::Http(HttpExporter::new(args)?))
}

fn print(span: &Span) {
    info!("span {} {:?}: {} events", span.name, span.attributes, span.events.len());
    for event in &span.events {
        debug!("span {} {}: {}", span.name, event.stream, event.line);
    }
}
