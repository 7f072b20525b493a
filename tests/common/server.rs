//! Test server management.
//!
//! Spawns and manages arenad instances for integration testing.

#![allow(dead_code)]

use std::net::TcpListener;
use std::path::PathBuf;
use std::process::{Child, Command};
use std::time::Duration;

use tokio::time::sleep;

/// Reserve a free localhost port.
pub fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind for port probe");
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

/// Cluster settings for a spawned node.
pub struct ClusterSpec {
    pub listen_port: u16,
    pub peers: Vec<(String, u16)>,
}

/// A test server instance.
pub struct TestServer {
    child: Child,
    port: u16,
    data_dir: PathBuf,
}

impl TestServer {
    /// Spawn a single-node server on `port`.
    pub async fn spawn(port: u16) -> anyhow::Result<Self> {
        Self::spawn_node("test-node", port, None).await
    }

    /// Spawn a named node, optionally participating in a cluster.
    pub async fn spawn_node(
        name: &str,
        port: u16,
        cluster: Option<ClusterSpec>,
    ) -> anyhow::Result<Self> {
        let data_dir = std::env::temp_dir().join(format!("arenad-test-{}-{}", name, port));
        std::fs::create_dir_all(&data_dir)?;

        let mut config_content = format!(
            r#"
[server]
name = "{name}"
metrics_port = 0

[listen]
realtime_addr = "127.0.0.1:{port}"

[limits]
ping_interval_secs = 5
pong_timeout_secs = 15

[matchmaker]
interval_secs = 1

[database]
path = "{data}/test.db"
"#,
            name = name,
            port = port,
            data = data_dir.display(),
        );

        if let Some(cluster) = cluster {
            config_content.push_str(&format!(
                "\n[cluster]\nlisten_addr = \"127.0.0.1:{}\"\n",
                cluster.listen_port
            ));
            for (peer_name, peer_port) in cluster.peers {
                config_content.push_str(&format!(
                    "\n[[cluster.peers]]\nname = \"{}\"\naddr = \"127.0.0.1:{}\"\n",
                    peer_name, peer_port
                ));
            }
        }

        let config_path = data_dir.join("config.toml");
        std::fs::write(&config_path, config_content)?;

        // Build path to the arenad binary (in workspace target dir).
        let cargo_manifest_dir = env!("CARGO_MANIFEST_DIR");
        let binary_path = PathBuf::from(cargo_manifest_dir).join("target/debug/arenad");

        let child = Command::new(&binary_path)
            .arg("-c")
            .arg(&config_path)
            .env("RUST_LOG", "info")
            .spawn()?;

        let server = Self {
            child,
            port,
            data_dir,
        };
        server.wait_ready().await?;
        Ok(server)
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    async fn wait_ready(&self) -> anyhow::Result<()> {
        for _ in 0..100 {
            if tokio::net::TcpStream::connect(("127.0.0.1", self.port))
                .await
                .is_ok()
            {
                return Ok(());
            }
            sleep(Duration::from_millis(100)).await;
        }
        anyhow::bail!("server on port {} did not become ready", self.port)
    }

    /// Kill the node abruptly, as a crash would.
    pub fn kill(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        let _ = std::fs::remove_dir_all(&self.data_dir);
    }
}
