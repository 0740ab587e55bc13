//! crossframe binary: runs a host window and its relay in one process and
//! issues API calls through them.
//!
//! ```text
//! host Orchestrator --call--> LoopbackPage --> relay Orchestrator --HTTP--> API
//!        ^                                            |
//!        +------------------- response ---------------+
//! ```
//!
//! Usage: `crossframe [--config PATH] [--post] API_PATH[?k=v&...]...`

use std::env;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use crossframe_boot::{
    BlackBox, BootBranch, BridgeConfig, Collaborators, CookieJar, HttpTokenService, InitOptions,
    MemoryCookieJar, Orchestrator, RelayParts, TokenStore, WindowContext,
};
use crossframe_transport::HttpFetcher;
use crossframe_transport::loopback::LoopbackPage;
use crossframe_types::{ApiRequest, decode_query, encode_query};
use serde_json::{Map, Value, json};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};
use url::Url;

const LOG_ENV: &str = "CROSSFRAME_LOG";
const TOKEN_ENV: &str = "CROSSFRAME_ACCESS_TOKEN";
const HOST_LOCATION: &str = "http://localhost/index.html";
const BLACKBOX_TAIL: usize = 20;

#[derive(Debug, Default, PartialEq, Eq)]
struct Args {
    config: Option<PathBuf>,
    post: bool,
    calls: Vec<String>,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> Result<Args> {
    let mut parsed = Args::default();
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                let Some(path) = args.next() else {
                    bail!("--config needs a path");
                };
                parsed.config = Some(PathBuf::from(path));
            }
            "--post" => parsed.post = true,
            flag if flag.starts_with("--") => bail!("unknown flag {flag}"),
            _ => parsed.calls.push(arg),
        }
    }
    Ok(parsed)
}

fn load_config(args: &Args) -> Result<BridgeConfig> {
    if let Some(path) = &args.config {
        return BridgeConfig::load_from(path)
            .with_context(|| format!("loading config from {}", path.display()));
    }
    Ok(BridgeConfig::load()?.unwrap_or_default())
}

/// `statuses/home_timeline?count=5` becomes a request with one param.
fn build_request(raw: &str, post: bool) -> ApiRequest {
    let (api, query) = raw.split_once('?').unwrap_or((raw, ""));
    let api = if api.starts_with('/') {
        api.to_string()
    } else {
        format!("/{api}")
    };
    let mut request = if post {
        ApiRequest::post(api)
    } else {
        ApiRequest::get(api)
    };
    let mut params: Vec<_> = decode_query(query).into_iter().collect();
    params.sort();
    for (key, value) in params {
        request = request.param(key, value);
    }
    request
}

fn init_tracing(blackbox: &BlackBox) {
    let env_filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(blackbox.layer())
        .with(env_filter)
        .init();
}

fn seed_token(jar: &Arc<MemoryCookieJar>, config: &BridgeConfig) {
    let Ok(token) = env::var(TOKEN_ENV) else {
        return;
    };
    let mut fields = Map::new();
    fields.insert("access_token".to_string(), Value::from(token));
    TokenStore::new(
        Arc::clone(jar) as Arc<dyn CookieJar>,
        config.cookie.clone(),
        config.appkey(),
    )
    .resolve_response(&encode_query(&fields));
}

async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

async fn run(config: BridgeConfig, args: &Args, blackbox: &BlackBox) -> Result<()> {
    let endpoints = config.endpoints()?;
    let host_location = Url::parse(HOST_LOCATION)?;
    let (page, inboxes) = LoopbackPage::new(&endpoints, host_location.origin().ascii_serialization());

    let embedder: Arc<LoopbackPage> = Arc::clone(&page);
    let jar = MemoryCookieJar::new();
    seed_token(&jar, &config);
    let tokens = HttpTokenService::new(
        Url::parse(&config.endpoints.exchange)?,
        Url::parse(&config.endpoints.query)?,
        config.timeouts.fetch(),
    )?;
    let host = Orchestrator::new(
        config.clone(),
        Collaborators {
            embedder,
            cookies: jar,
            tokens: Arc::new(tokens.clone()),
        },
    )?;
    let branch = host.boot(WindowContext {
        messages: Some(inboxes.host),
        ..WindowContext::top_level(host_location)
    });
    tracing::info!("host booted as {branch:?}");
    host.init(InitOptions::default());
    host.document_ready_detected();
    settle().await;

    let (relay_page, _unused) = LoopbackPage::new(&endpoints, endpoints.relay_origin());
    let fetcher = HttpFetcher::new(config.endpoints.api.clone(), config.timeouts.fetch())?;
    let relay = Orchestrator::new(
        config,
        Collaborators {
            embedder: relay_page,
            cookies: MemoryCookieJar::new(),
            tokens: Arc::new(tokens),
        },
    )?;
    let branch = relay.boot(WindowContext {
        framed: true,
        messages: Some(inboxes.relay),
        relay: Some(RelayParts {
            fetcher: Arc::new(fetcher),
            parent: page,
        }),
        ..WindowContext::top_level(endpoints.relay.clone())
    });
    if branch != BootBranch::Relay {
        bail!("relay window booted as {branch:?}");
    }

    if args.calls.is_empty() {
        let status = host.login_status();
        println!(
            "{}",
            json!({
                "token_ready": host.is_token_ready(),
                "everything_ready": host.is_everything_ready(),
                "user": status.map(|status| json!({"name": status.name, "nick": status.nick})),
            })
        );
        return Ok(());
    }

    let mut failed = 0_usize;
    for raw in &args.calls {
        let request = build_request(raw, args.post);
        let api = request.api.clone();
        match host.call(request).await {
            Ok(reply) => {
                let output = json!({"api": api, "body": reply.body.into_wire()});
                println!("{}", serde_json::to_string_pretty(&output)?);
            }
            Err(failure) => {
                failed += 1;
                let (status, reason) = failure.pair();
                eprintln!("{api}: failed with status {status}: {reason}");
                if let Some(response) = failure.response() {
                    eprintln!("{}", response.body.clone().into_wire());
                }
            }
        }
    }
    if failed > 0 {
        eprintln!("{}", blackbox.last(Some(BLACKBOX_TAIL)));
        bail!("{failed} of {} calls failed", args.calls.len());
    }
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let blackbox = BlackBox::new(false, false);
    init_tracing(&blackbox);

    let args = parse_args(env::args().skip(1))?;
    let config = load_config(&args)?;
    run(config, &args, &blackbox).await
}
