//! Loading a plugin from its configured guest URL.

mod common;

use kubewasm_core::PluginConfig;
use kubewasm_runtime::{PluginError, WasmPlugin};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use common::{filter_only_guest, init_tracing};

fn guest_bytes() -> Vec<u8> {
    wat::parse_str(filter_only_guest()).unwrap()
}

#[tokio::test]
async fn loads_from_a_file_path() {
    init_tracing();
    let path = std::env::temp_dir().join(format!("kubewasm-load-{}.wasm", std::process::id()));
    std::fs::write(&path, guest_bytes()).unwrap();

    let config = PluginConfig::new(&path.to_string_lossy());
    let interfaces = WasmPlugin::load("from-file", &config).await.unwrap();
    assert_eq!(interfaces.kind(), "Filter");
    assert_eq!(interfaces.plugin().name(), "from-file");
    assert_eq!(interfaces.plugin().digest().len(), 64);

    std::fs::remove_file(&path).unwrap();
}

#[tokio::test]
async fn loads_over_http() {
    init_tracing();
    let body = guest_bytes();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 4096];
        let _ = socket.read(&mut buf).await.unwrap();
        let head = format!(
            "HTTP/1.1 200 OK\r\ncontent-type: application/wasm\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
            body.len()
        );
        socket.write_all(head.as_bytes()).await.unwrap();
        socket.write_all(&body).await.unwrap();
        socket.shutdown().await.unwrap();
    });

    let config = PluginConfig::new(&format!("http://{addr}/filter.wasm"));
    let interfaces = WasmPlugin::load("from-http", &config).await.unwrap();
    assert_eq!(interfaces.kind(), "Filter");
}

#[tokio::test]
async fn same_bytes_give_the_same_digest() {
    let bytes = guest_bytes();
    let config = PluginConfig::new("inline.wasm");
    let a = WasmPlugin::from_bytes("a", &bytes, &config).unwrap();
    let b = WasmPlugin::from_bytes("b", &bytes, &config).unwrap();
    assert_eq!(a.plugin().digest(), b.plugin().digest());
}

#[tokio::test]
async fn loads_from_scheduler_args() {
    init_tracing();
    let path = std::env::temp_dir().join(format!("kubewasm-args-{}.wasm", std::process::id()));
    std::fs::write(&path, guest_bytes()).unwrap();

    let args = serde_json::json!({
        "guestUrl": path.to_string_lossy(),
        "logSeverity": 2,
    });
    let interfaces = WasmPlugin::load_from_args("from-args", args).await.unwrap();
    assert_eq!(interfaces.kind(), "Filter");
    assert_eq!(interfaces.plugin().name(), "from-args");

    std::fs::remove_file(&path).unwrap();
}

#[tokio::test]
async fn args_without_guest_url_are_a_config_error() {
    let args = serde_json::json!({"guestConfig": "{}"});
    let err = WasmPlugin::load_from_args("no-url", args).await.err().unwrap();
    assert!(matches!(err, PluginError::Config(_)), "{err}");

    let args = serde_json::json!({"guestUrl": "  "});
    let err = WasmPlugin::load_from_args("blank-url", args).await.err().unwrap();
    assert!(matches!(err, PluginError::Config(_)), "{err}");
}

#[tokio::test]
async fn unsupported_scheme_fails_the_load() {
    let config = PluginConfig::new("ftp://example.com/plugin.wasm");
    let err = WasmPlugin::load("ftp", &config).await.err().unwrap();
    assert!(matches!(err, PluginError::Source(_)), "{err}");
}
