use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;

use swcache::cache::{CacheStorage, Served, SqliteStorage};
use swcache::config::Config;
use swcache::net::{HttpClient, Method, Request, Response};
use swcache::worker::{Registration, WorkerState};

#[derive(Parser, Debug)]
#[command(name = "swcache")]
#[command(about = "Offline-capable caching worker for a web origin")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/swcache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Origin to serve (overrides the config file)
  #[arg(short, long)]
  origin: Option<String>,

  /// Cache database path (overrides the config file)
  #[arg(long)]
  database: Option<PathBuf>,

  /// Write logs to a daily rolling file in this directory instead of stderr
  #[arg(long)]
  log_dir: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Install the configured worker version and activate it
  Install,

  /// Fetch URLs (or origin-relative paths) through the active worker
  Fetch {
    #[arg(required = true)]
    urls: Vec<String>,

    /// Request method
    #[arg(short = 'X', long, default_value = "GET")]
    method: String,

    /// Extra request header, as "Name: value"
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,

    /// Request body
    #[arg(short, long)]
    data: Option<String>,

    /// Print response bodies to stdout
    #[arg(long)]
    body: bool,
  },

  /// List cache stores
  Caches {
    /// Also list the URLs held in each store
    #[arg(long)]
    entries: bool,
  },

  /// Post a JSON message to the worker (e.g. '{"type":"SKIP_WAITING"}')
  Message { json: String },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _guard = swcache::logging::init(args.log_dir.as_deref())?;

  let config = Config::load(args.config.as_deref(), args.origin)?;
  let config = if let Some(database) = args.database {
    Config {
      database: Some(database),
      ..config
    }
  } else {
    config
  };

  let origin = config.origin_url()?;
  let storage = Arc::new(SqliteStorage::open_at(&config.database_path()?)?);
  let network = Arc::new(HttpClient::new(&config.http)?);
  let mut registration = Registration::new(origin.clone(), Arc::clone(&storage), network);

  match args.command {
    Command::Install => {
      let state = registration.register(config.worker.clone()).await?;
      match state {
        WorkerState::Activated => println!("{} installed and active", config.worker.version),
        state => println!("{} {}", config.worker.version, state),
      }
    }
    Command::Fetch {
      urls,
      method,
      headers,
      data,
      body,
    } => {
      registration.resume(config.worker.clone())?;
      let method = Method::parse(&method)?;

      for target in urls {
        let url = if target.starts_with('/') {
          origin
            .join(&target)
            .map_err(|e| eyre!("Invalid path {}: {}", target, e))?
            .to_string()
        } else {
          target
        };

        let mut request = Request::parse(&url)?.with_method(method);
        for header in &headers {
          let (name, value) = header
            .split_once(':')
            .ok_or_else(|| eyre!("Header must look like 'Name: value': {}", header))?;
          request = request.with_header(name.trim(), value.trim());
        }
        if let Some(data) = &data {
          request = request.with_body(data.as_bytes());
        }

        let served = registration.fetch(request).await?;
        print_served(&url, &served, body);
      }
    }
    Command::Caches { entries } => {
      for name in storage.keys()? {
        let urls = storage.entries(&name)?;
        let marker = if name == config.worker.version { "*" } else { " " };
        println!("{} {} ({} entries)", marker, name, urls.len());
        if entries {
          for url in urls {
            println!("    {}", url);
          }
        }
      }
    }
    Command::Message { json } => {
      let data = serde_json::from_str(&json).map_err(|e| eyre!("Invalid JSON message: {}", e))?;
      registration.resume(config.worker.clone())?;
      if registration.post_message(data).await? {
        println!("skip-waiting requested; {} is already active", config.worker.version);
      } else {
        println!("message ignored");
      }
    }
  }

  Ok(())
}

fn print_served(url: &str, served: &Served<Response>, body: bool) {
  let resp = &served.data;
  let cached = served
    .cached_at
    .map(|at| format!(" cached {}", at.format("%Y-%m-%d %H:%M:%S")))
    .unwrap_or_default();

  println!(
    "{} {} [{}{}] {} ({} bytes, {})",
    resp.status,
    resp.status_text,
    served.source,
    cached,
    url,
    resp.body.len(),
    resp.header("content-type").unwrap_or("unknown type"),
  );

  if body {
    println!("{}", String::from_utf8_lossy(&resp.body));
  }
}
