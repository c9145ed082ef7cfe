//! Request CLI command: issue requests through the connector

use crate::config::settings::ConnectorConfig;
use crate::connector::HttpConnector;
use crate::models::{CallResult, ClientRequest};
use anyhow::{anyhow, Context, Result};
use clap::Args;
use hyper::Method;
use tokio::sync::mpsc;
use tracing::{debug, info};

#[derive(Debug, Args)]
pub struct RequestArgs {
    /// Absolute http(s) URLs to request
    #[arg(required = true)]
    pub urls: Vec<String>,

    /// HTTP method
    #[arg(short = 'X', long, default_value = "GET")]
    pub method: String,

    /// Extra request header, as "Name: value" (repeatable)
    #[arg(short = 'H', long = "header")]
    pub headers: Vec<String>,

    /// Request body
    #[arg(short, long)]
    pub data: Option<String>,

    /// Deliver results through callbacks instead of waiting on each call
    #[arg(long, default_value = "false")]
    pub callback: bool,

    /// Do not wait for responses (fire-and-forget)
    #[arg(long, default_value = "false")]
    pub no_response: bool,

    /// Print response headers
    #[arg(short, long, default_value = "false")]
    pub include: bool,

    /// Forward proxy host
    #[arg(long)]
    pub proxy_host: Option<String>,

    /// Forward proxy port
    #[arg(long)]
    pub proxy_port: Option<String>,

    /// Maximum number of connections
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Maximum number of connections per destination
    #[arg(long)]
    pub max_connections_per_host: Option<usize>,

    /// Response timeout in milliseconds
    #[arg(long)]
    pub timeout_ms: Option<u64>,
}

impl RequestArgs {
    /// Apply command-line overrides on top of the loaded configuration
    pub fn to_config(&self, base: &ConnectorConfig) -> ConnectorConfig {
        let mut config = base.clone();

        if let Some(host) = &self.proxy_host {
            config.proxy_host = Some(host.clone());
        }
        if let Some(port) = &self.proxy_port {
            config.proxy_port = Some(port.clone());
        }
        if self.max_connections.is_some() {
            config.max_total_connections = self.max_connections;
        }
        if self.max_connections_per_host.is_some() {
            config.max_connections_per_destination = self.max_connections_per_host;
        }
        if let Some(timeout) = self.timeout_ms {
            config.response_timeout_ms = timeout;
        }

        config
    }

    /// Build the request for one URL
    pub fn build_request(&self, url: &str) -> Result<ClientRequest> {
        let method = Method::from_bytes(self.method.to_uppercase().as_bytes())
            .map_err(|_| anyhow!("Invalid method '{}'", self.method))?;

        let mut request = ClientRequest::new(method, url).with_context(|| format!("Invalid URL '{}'", url))?;

        for header in &self.headers {
            let (name, value) = header
                .split_once(':')
                .ok_or_else(|| anyhow!("Header '{}' is not of the form 'Name: value'", header))?;
            request = request.with_header(name.trim(), value.trim())?;
        }

        if let Some(data) = &self.data {
            request = request.with_body(data.clone());
        }

        if self.no_response {
            request = request.without_response();
        }

        Ok(request)
    }

    /// Issue every request and print the results
    pub async fn execute(&self, base: &ConnectorConfig) -> Result<()> {
        let config = self.to_config(base);
        debug!("Request configuration: {:?}", config);

        let connector = HttpConnector::start(config).context("Failed to start the connector")?;

        let results = if self.callback {
            self.run_with_callbacks(&connector).await?
        } else {
            let mut results = Vec::with_capacity(self.urls.len());
            for url in &self.urls {
                let request = self.build_request(url)?;
                results.push((url.clone(), connector.send(request).await));
            }
            results
        };

        let mut failures = 0;
        for (url, result) in &results {
            if !self.print_result(url, result) {
                failures += 1;
            }
        }

        connector.log_stats();
        connector.stop().await;

        if failures > 0 {
            return Err(anyhow!("{} of {} request(s) failed", failures, results.len()));
        }
        Ok(())
    }

    async fn run_with_callbacks(&self, connector: &HttpConnector) -> Result<Vec<(String, CallResult)>> {
        let (tx, mut rx) = mpsc::unbounded_channel();

        for url in &self.urls {
            let tx = tx.clone();
            let tag = url.clone();
            let request = self.build_request(url)?.on_response(move |result| {
                let _ = tx.send((tag, result));
            });
            connector.handle(request).await;
        }
        drop(tx);

        let mut results = Vec::with_capacity(self.urls.len());
        while let Some(result) = rx.recv().await {
            results.push(result);
        }
        info!("📬 {} callback(s) received", results.len());
        Ok(results)
    }

    fn print_result(&self, url: &str, result: &CallResult) -> bool {
        match result {
            Ok(response) => {
                println!("{} -> {} {}", url, response.status.as_u16(), response.reason);
                if self.include {
                    for (name, value) in response.headers.iter() {
                        println!("{}: {}", name, value.to_str().unwrap_or("<binary>"));
                    }
                    println!();
                }
                if !response.body.is_empty() {
                    println!("{}", response.text());
                }
                true
            }
            Err(e) => {
                println!("{} -> ERROR [{:?}] {}", url, e.kind(), e);
                false
            }
        }
    }
}
