//! Daemon loop driven over its control socket

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use nginit::config::Config;
use nginit::daemon;
use nginit::engine::{Engine, RecordingLauncher, SystemState};
use nginit::plugins;
use nginit::protocol::{self, Reply, Request, RequestBody};
use tokio::net::UnixStream;

fn config(dir: &Path) -> Config {
    Config {
        socket_path: dir.join("run").join("control.socket"),
        script_dir: dir.join("scripts"),
        dbus: false,
        initctl: false,
        ..Config::default()
    }
}

async fn connect(path: &Path) -> UnixStream {
    for _ in 0..100 {
        if let Ok(stream) = UnixStream::connect(path).await {
            return stream;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("daemon never listened on {}", path.display());
}

async fn call(path: &Path, body: RequestBody) -> Reply {
    let mut stream = connect(path).await;
    protocol::write_message_async(&mut stream, &Request::new(body)).await.unwrap();
    protocol::read_message_async(&mut stream).await.unwrap()
}

#[tokio::test]
async fn test_control_socket_then_sigterm() {
    let dir = PathBuf::from(format!("/tmp/nginit-daemon-test-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(dir.join("scripts")).unwrap();

    let config = config(&dir);
    let socket = config.socket_path.clone();
    let mut engine = Engine::new(config, Box::new(RecordingLauncher::new()));
    plugins::register_builtin(&mut engine);

    let client = async {
        // A connection that never sends must not hold up anyone else
        let idle = connect(&socket).await;
        let asked = Instant::now();
        let created = call(
            &socket,
            RequestBody::CreateService {
                service_type: "virtual".into(),
                name: "net/lo".into(),
                origin: "/etc/initng/net".into(),
            },
        )
        .await;
        assert_eq!(created, Reply::ok());
        assert!(asked.elapsed() < Duration::from_secs(1), "answered after {:?}", asked.elapsed());

        let described = call(
            &socket,
            RequestBody::SetVariable {
                service: "net/lo".into(),
                var_type: "description".into(),
                var_name: None,
                value: Some("Loopback interface".into()),
            },
        )
        .await;
        assert_eq!(described, Reply::ok());

        let started = call(
            &socket,
            RequestBody::Done {
                service: "net/lo".into(),
            },
        )
        .await;
        assert_eq!(started, Reply::ok());

        let description = call(
            &socket,
            RequestBody::GetVariable {
                service: "net/lo".into(),
                var_type: "description".into(),
                var_name: None,
            },
        )
        .await;
        assert_eq!(description, Reply::ok_with("Loopback interface"));

        nix::sys::signal::raise(nix::sys::signal::Signal::SIGTERM).unwrap();
        drop(idle);
    };

    let (result, ()) = tokio::time::timeout(Duration::from_secs(10), async {
        tokio::join!(daemon::run(engine, false), client)
    })
    .await
    .expect("daemon did not stop");

    assert_eq!(result.unwrap(), SystemState::Exit);
    assert!(!socket.exists());
    let _ = std::fs::remove_dir_all(&dir);
}
