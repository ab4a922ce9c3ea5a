//! Docker container management for MySQL integration tests

use crate::config::ConnectionOptions;
use crate::driver::{Driver, Session};
use crate::mysql::client::MySqlDriver;
use anyhow::{Context, Result};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// A throwaway MySQL 8 server running in Docker
pub struct MySQLContainer {
    /// Container name
    pub container_name: String,
    /// Host port bound to the server's 3306
    pub host_port: u16,
    /// Image name (official mysql image)
    pub image_name: String,
}

impl MySQLContainer {
    pub fn new(container_name: &str, host_port: u16) -> Self {
        Self {
            container_name: container_name.to_string(),
            host_port,
            image_name: "mysql:8.0".to_string(),
        }
    }

    /// Connection options for the container's `testdb` database
    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            host: Some("127.0.0.1".to_string()),
            port: Some(self.host_port),
            user: Some("root".to_string()),
            password: Some("testpass".to_string()),
            database: Some("testdb".to_string()),
            ..ConnectionOptions::default()
        }
    }

    /// Starts the container, replacing any container with the same name
    pub fn start(&self) -> Result<()> {
        info!("Starting MySQL container: {}", self.container_name);

        self.remove_quietly();

        let output = Command::new("docker")
            .args([
                "run",
                "--name",
                &self.container_name,
                "-e",
                "MYSQL_ROOT_PASSWORD=testpass",
                "-e",
                "MYSQL_DATABASE=testdb",
                "-p",
                &format!("{}:3306", self.host_port),
                "-d",
                &self.image_name,
            ])
            .output()
            .context("Failed to start Docker container")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("Failed to start container: {stderr}");
        }

        let container_id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        info!("Started container: {}", container_id);

        Ok(())
    }

    /// Waits until the server accepts connections
    pub async fn wait_until_ready(&self, timeout_secs: u64) -> Result<()> {
        info!("Waiting for MySQL to be ready...");

        let start = Instant::now();
        let timeout = Duration::from_secs(timeout_secs);

        while start.elapsed() < timeout {
            match self.session().await {
                Ok(session) => {
                    let _ = session.disconnect().await;
                    info!("MySQL is ready!");
                    return Ok(());
                }
                Err(e) => {
                    debug!("Connection attempt failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(1000)).await;
                }
            }
        }

        anyhow::bail!("MySQL did not become ready within {timeout_secs} seconds")
    }

    /// Opens a session through the MySQL driver
    pub async fn session(&self) -> Result<Arc<dyn Session>> {
        let session = MySqlDriver::default()
            .connect(&self.connection_options())
            .await?;
        session.query("SELECT 1").await?;
        Ok(session)
    }

    /// Runs setup statements, e.g. `CREATE TABLE`
    pub async fn execute_all(&self, statements: &[&str]) -> Result<()> {
        let session = self.session().await?;
        for sql in statements {
            session
                .execute(sql)
                .await
                .with_context(|| format!("Failed to execute: {sql}"))?;
        }
        session.disconnect().await?;
        Ok(())
    }

    /// Stops and removes the container
    pub fn stop(&self) -> Result<()> {
        info!("Stopping container: {}", self.container_name);

        let output = Command::new("docker")
            .args(["rm", "-f", &self.container_name])
            .output()
            .context("Failed to remove container")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            debug!("Failed to remove container (may not exist): {}", stderr);
        }

        info!("Container stopped and removed");
        Ok(())
    }

    fn remove_quietly(&self) {
        let _ = Command::new("docker")
            .args(["rm", "-f", &self.container_name])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
    }
}

impl Drop for MySQLContainer {
    fn drop(&mut self) {
        self.remove_quietly();
    }
}
