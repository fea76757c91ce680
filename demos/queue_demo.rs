// Copyright 2020 Joyent, Inc.

use std::process;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::{crate_version, value_t, App, Arg, ArgMatches};
use serde_json::Value;
use slog::{error, info, o, Drain, Level, LevelFilter, Logger};
use tokio_util::sync::CancellationToken;

use halibut_queue::{
    Endpoint, MemoryStore, QueueSettings, RequestMessage, RequestQueue,
    RequestQueueFactory, ResponseMessage, ServerError, ServerErrorKind,
};

static APP: &'static str = "queue-demo";
static DEFAULT_ENDPOINT: &'static str = "poll://demo-worker/";
const DEFAULT_WORKERS: usize = 3;
const DEFAULT_REQUESTS: usize = 10;

pub fn parse_opts<'a>(app: String) -> ArgMatches<'a> {
    App::new(app)
        .about("Runs a sender and a pool of workers over an in-memory queue")
        .version(crate_version!())
        .arg(
            Arg::with_name("workers")
                .help("Number of workers polling the endpoint (Default: 3)")
                .long("workers")
                .short("w")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("requests")
                .help("Number of requests to send (Default: 10)")
                .long("requests")
                .short("n")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("method")
                .help("Method to call: echo, fail or hang")
                .long("method")
                .short("m")
                .takes_value(true)
                .required(true),
        )
        .arg(
            Arg::with_name("args")
                .help("JSON-encoded arguments for the method")
                .long("args")
                .takes_value(true)
                .required(true),
        )
        .arg(
            Arg::with_name("pickup_timeout")
                .help("Seconds a request may wait to be collected")
                .long("pickup-timeout")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("verbose")
                .long("verbose")
                .short("v")
                .takes_value(false),
        )
        .get_matches()
}

fn demo_logger(verbose: bool) -> Logger {
    let level = if verbose { Level::Debug } else { Level::Info };
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    Logger::root(
        Mutex::new(LevelFilter::new(
            slog_term::FullFormat::new(plain).build(),
            level,
        ))
        .fuse(),
        o!("app" => APP),
    )
}

fn handle(request: &RequestMessage) -> Option<ResponseMessage> {
    match request.m.method.as_str() {
        "echo" => Some(ResponseMessage::ok(request.id, request.params.clone())),
        "fail" => Some(ResponseMessage::from_error(
            request.id,
            ServerError::new(ServerErrorKind::RemoteFailure, "asked to fail"),
        )),
        // Never answers, so the sender's timeouts are exercised.
        _ => None,
    }
}

async fn run_worker(
    queue: Arc<RequestQueue>,
    stop: CancellationToken,
    log: Logger,
) {
    while !stop.is_cancelled() {
        let dequeued = match queue.dequeue(Duration::from_secs(30), &stop).await {
            Ok(Some(dequeued)) => dequeued,
            Ok(None) => continue,
            Err(e) if e.is_cancelled() => break,
            Err(e) => {
                error!(log, "dequeue failed"; "error" => %e);
                break;
            }
        };
        info!(log, "collected request"; "activity_id" => %dequeued.id());
        if let Some(response) = handle(&dequeued.message) {
            if let Err(e) = queue.respond(response, &stop).await {
                error!(log, "respond failed"; "error" => %e);
            }
        }
    }
}

#[tokio::main]
async fn main() {
    let matches = parse_opts(APP.to_string());
    let log = demo_logger(matches.is_present("verbose"));

    let workers = value_t!(matches, "workers", usize).unwrap_or(DEFAULT_WORKERS);
    let requests =
        value_t!(matches, "requests", usize).unwrap_or(DEFAULT_REQUESTS);
    let pickup = value_t!(matches, "pickup_timeout", u64).unwrap_or(30);
    let method = matches.value_of("method").unwrap_or("echo").to_string();
    let args: Value = match matches.value_of("args").map(serde_json::from_str) {
        Some(Ok(args)) => args,
        Some(Err(e)) => {
            eprintln!("args must be valid JSON: {}", e);
            process::exit(1)
        }
        None => Value::Null,
    };

    let settings = QueueSettings::default()
        .with_namespace(APP)
        .with_request_pickup_timeout(Duration::from_secs(pickup));
    let store = MemoryStore::new();
    let factory = RequestQueueFactory::new(store, settings, Some(&log))
        .unwrap_or_else(|e| {
            eprintln!("invalid settings: {}", e);
            process::exit(1)
        });
    factory.start();

    let endpoint = Endpoint::new(DEFAULT_ENDPOINT);
    let queue = factory.queue(&endpoint);
    let stop = CancellationToken::new();

    let pool: Vec<_> = (0..workers)
        .map(|n| {
            let worker_log = log.new(o!("worker" => n));
            tokio::spawn(run_worker(Arc::clone(&queue), stop.clone(), worker_log))
        })
        .collect();

    for _ in 0..requests {
        let request = RequestMessage::new(
            endpoint.clone(),
            "Demo",
            method.as_str(),
            args.clone(),
        );
        match queue.queue_and_wait(request, &CancellationToken::new()).await {
            Ok(response) => match response.error {
                Some(err) => println!("error: {}", err),
                None => println!(
                    "{}",
                    response.result.unwrap_or(Value::Null)
                ),
            },
            Err(e) => {
                eprintln!("request failed: {}", e);
                break;
            }
        }
    }

    stop.cancel();
    for worker in pool {
        let _ = worker.await;
    }
    factory.shutdown().await;
}
