use std::collections::HashMap;
use anyhow::{anyhow, Result};

/// Sink selection in the form `kind,key=value,...`.
#[derive(Debug)]
pub struct Args {
    args: HashMap<String, String>,
}

impl Args {
    pub fn parse(arg: &str) -> Result<(&str, Self)> {
        let mut split = arg.split(',');
        let kind = split.next().unwrap_or("").trim();

        if kind.is_empty() {
            return Err(anyhow!("missing sink kind in '{}'", arg));
        }

        let mut args = HashMap::new();
        for pair in split.filter(|pair| !pair.is_empty()) {
            match pair.split_once('=') {
                Some((k, v)) => args.insert(k.trim().to_owned(), v.to_owned()),
                None         => return Err(anyhow!("invalid sink arg '{}'", pair)),
            };
        }

        Ok((kind, Self { args }))
    }

    pub fn get(&self, name: &str) -> Result<&str> {
        match self.args.get(name) {
            Some(value) => Ok(value.as_str()),
            None        => Err(anyhow!("missing arg '{}'", name)),
        }
    }

    pub fn opt(&self, name: &str) -> Option<&str> {
        self.args.get(name).map(String::as_str)
    }
}
