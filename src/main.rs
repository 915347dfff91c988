#[macro_use]
extern crate clap;
#[macro_use]
extern crate lazy_static;

use clap::App;
use env_logger::{from_env, Env};
use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify};
use slicer::dispatcher::{purge_loop, Dispatcher};
use slicer::errors::WorkerError;
use slicer::pool::{Factory, WorkerPool};
use slicer::server::{console_conn, logs_conn, UdpServer, UnixServer};
use slicer::worker::{Runtime, Worker};
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;

const XRAY_ADDR: &str = "127.0.0.1:9090";

lazy_static! {
    static ref RUNTIMES: HashMap<&'static str, Runtime> = {
        let stub = Runtime {
            name: String::new(),
            console_addr: PathBuf::new(),
            logs_addr: PathBuf::new(),
            cmd: String::new(),
            args: Vec::new(),
            user: String::new(),
            group: String::new(),
            chroot: PathBuf::new(),
            nsjail: PathBuf::new(),
        };
        let mut map = HashMap::new();
        map.insert(
            "python2.7",
            Runtime {
                name: "python2.7".to_string(),
                cmd: "/usr/bin/python".to_string(),
                args: vec!["/var/runtime/awslambda/bootstrap.py".to_string()],
                chroot: PathBuf::from("$PREFIX/chroot/python2.7"),
                ..stub.clone()
            },
        );
        map.insert(
            "python3.7",
            Runtime {
                name: "python3.7".to_string(),
                cmd: "/var/rapid/init".to_string(),
                args: vec!["--bootstrap".to_string(), "/var/runtime/bootstrap".to_string()],
                chroot: PathBuf::from("$PREFIX/chroot/python3.7"),
                ..stub.clone()
            },
        );
        map.insert(
            "go1.x",
            Runtime {
                name: "go1.x".to_string(),
                cmd: "/var/runtime/aws-lambda-go".to_string(),
                args: Vec::new(),
                chroot: PathBuf::from("$PREFIX/chroot/go1.x"),
                ..stub
            },
        );
        map
    };
}

#[tokio::main]
async fn main() {
    let yaml = load_yaml!("cli.yml");
    let matches = App::from_yaml(yaml).get_matches();

    let log_level = matches.value_of("log_level").unwrap();
    from_env(Env::default().default_filter_or(log_level)).init();

    let console_path = PathBuf::from(matches.value_of("console").unwrap());
    let logs_path = PathBuf::from(matches.value_of("logs").unwrap());
    let http_addr = matches.value_of("http").unwrap().to_string();
    let task = matches
        .value_of("task")
        .map(PathBuf::from)
        .unwrap_or_else(|| std::env::current_dir().expect("cannot determine working directory"));
    let prefix = matches
        .value_of("prefix")
        .map(str::to_string)
        .unwrap_or_else(|| std::env::var("HOME").expect("cannot determine home directory"));
    let handler = matches.value_of("handler").unwrap().to_string();
    let workers: usize = matches
        .value_of("workers")
        .unwrap()
        .parse()
        .expect("bad workers value");
    let debug = matches.is_present("debug");

    let runtime_name = matches.value_of("runtime").unwrap();
    let mut runtime = match RUNTIMES.get(runtime_name) {
        Some(runtime) => runtime.clone(),
        None => {
            log::error!("unknown runtime: {}", runtime_name);
            std::process::exit(1);
        }
    };
    log::info!("selected runtime: {}", runtime_name);

    runtime.console_addr = console_path.clone();
    runtime.logs_addr = logs_path.clone();
    runtime.user = matches.value_of("user").unwrap().to_string();
    runtime.group = matches.value_of("group").unwrap().to_string();
    runtime.nsjail = PathBuf::from(matches.value_of("nsjail").unwrap());
    runtime.chroot = PathBuf::from(runtime.chroot.to_string_lossy().replace("$PREFIX", &prefix));

    let console = Arc::new(UnixServer::bind(&console_path).expect("cannot bind console socket"));
    let logs = Arc::new(UnixServer::bind(&logs_path).expect("cannot bind logs socket"));
    let xray = UdpServer::bind(XRAY_ADDR).await.expect("cannot bind xray socket");

    let pool = Arc::new(WorkerPool::new(worker_factory(runtime, task.clone(), handler)));

    {
        let console = console.clone();
        tokio::spawn(async move {
            log::info!("starting console server: {}", console_path.display());
            if let Err(err) = console.serve(console_conn).await {
                log::error!("console server: {}", err);
                std::process::exit(1);
            }
        });
    }
    {
        let logs = logs.clone();
        tokio::spawn(async move {
            log::info!("starting log server: {}", logs_path.display());
            if let Err(err) = logs.serve(move |conn| logs_conn(conn, debug)).await {
                log::error!("log server: {}", err);
                std::process::exit(1);
            }
        });
    }
    tokio::spawn(async move {
        log::info!("starting xray server: {}", XRAY_ADDR);
        let err = xray
            .serve(|data| println!("xray {}", String::from_utf8_lossy(data)))
            .await;
        if let Err(err) = err {
            log::error!("xray server: {}", err);
            std::process::exit(1);
        }
    });

    // reload with naive debounce
    let (purge_tx, purge_rx) = mpsc::unbounded_channel();
    {
        let pool = pool.clone();
        tokio::spawn(purge_loop(purge_rx, move || {
            let pool = pool.clone();
            async move {
                if let Err(err) = pool.purge().await {
                    log::error!("purge: {}", err);
                }
            }
        }));
    }

    watch_task_dir(&task, purge_tx).expect("cannot watch task directory");

    {
        let pool = pool.clone();
        let console = console.clone();
        let logs = logs.clone();
        tokio::spawn(async move {
            let mut term = signal(SignalKind::terminate()).expect("cannot install SIGTERM handler");
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
            log::info!("signal");
            if let Err(err) = pool.purge().await {
                log::error!("purge on shutdown: {}", err);
            }
            let _ = console.close();
            let _ = logs.close();
            std::process::exit(1);
        });
    }

    log::info!("starting http server: {}", http_addr);
    let listener = tokio::net::TcpListener::bind(&http_addr)
        .await
        .expect("cannot bind http address");
    let dispatcher = Dispatcher::new(pool, workers, debug);
    axum::serve(listener, dispatcher.router())
        .await
        .expect("http server failed");
}

fn worker_factory(runtime: Runtime, task: PathBuf, handler: String) -> Factory {
    Arc::new(move || {
        let runtime = runtime.clone();
        let task = task.clone();
        let handler = handler.clone();
        let boot: Pin<Box<dyn Future<Output = Result<Worker, WorkerError>> + Send>> =
            Box::pin(async move {
                log::info!("starting lambda function: {}", handler);
                Worker::new(&runtime, &task, &handler).await
            });
        boot
    })
}

/// Feed every inotify event on the task directory into the purge channel.
/// The debounce on the consumer side turns event storms into one purge.
fn watch_task_dir(dir: &Path, purge: mpsc::UnboundedSender<()>) -> nix::Result<()> {
    let mask = AddWatchFlags::IN_CREATE
        | AddWatchFlags::IN_CLOSE_WRITE
        | AddWatchFlags::IN_DELETE
        | AddWatchFlags::IN_MODIFY
        | AddWatchFlags::IN_MOVED_FROM
        | AddWatchFlags::IN_MOVED_TO;

    let inotify = Inotify::init(InitFlags::IN_CLOEXEC)?;
    inotify.add_watch(dir, mask)?;

    std::thread::spawn(move || loop {
        match inotify.read_events() {
            Ok(events) => {
                for _ in events {
                    let _ = purge.send(());
                }
            }
            Err(err) => {
                log::error!("task watcher: {}", err);
                std::process::exit(1);
            }
        }
    });
    Ok(())
}
