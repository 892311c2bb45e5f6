//! [`ShellKdcAdmin`]: the real `KdcAdmin` adapter, shelling out to MIT
//! Kerberos's `kadmin`/`kadmin.local`.
//!
//! Each call is a `tokio::process::Command` invocation wrapped in a
//! per-call timeout, with the exit code and stderr classified into
//! ok/retryable/fatal buckets per the table below.

use std::{process::Output, time::Duration};

use async_trait::async_trait;
use broker_core::keytab::{KdcAdmin, KeytabBlob, SetPasswordOutcome};
use rand::RngCore;
use tokio::process::Command;

/// How to invoke the KDC administrative tool.
#[derive(Debug, Clone)]
pub enum KdcTool {
    /// `kadmin.local`, run on the same host as the KDC database; no
    /// authentication needed.
    Local { binary: String },
    /// `kadmin`, authenticating as `admin_principal` via `keytab_path`.
    Remote {
        binary: String,
        admin_principal: String,
        keytab_path: String,
        server: String,
    },
}

impl KdcTool {
    fn command(&self) -> Command {
        match self {
            KdcTool::Local { binary } => Command::new(binary),
            KdcTool::Remote { binary, .. } => Command::new(binary),
        }
    }

    /// The leading args common to every invocation with this tool (auth,
    /// server selection), before the `-q <query>` pair.
    fn base_args(&self) -> Vec<String> {
        match self {
            KdcTool::Local { .. } => vec![],
            KdcTool::Remote {
                admin_principal,
                keytab_path,
                server,
                ..
            } => vec![
                "-p".to_owned(),
                admin_principal.clone(),
                "-k".to_owned(),
                "-t".to_owned(),
                keytab_path.clone(),
                "-s".to_owned(),
                server.clone(),
            ],
        }
    }
}

/// Shells out to `kadmin`/`kadmin.local` to set principal passwords and
/// extract keytabs.
///
/// # Exit-code / stderr classification table
///
/// `set_password` (`kadmin ... -q "cpw -pw <password> <principal>"`):
///
/// | Condition                                             | Outcome              |
/// |--------------------------------------------------------|----------------------|
/// | exit 0                                                  | `Ok`                 |
/// | timed out (no exit within [`Self::call_timeout`])       | `Retryable`          |
/// | stderr contains "Cannot contact any KDC"                | `Retryable`          |
/// | stderr contains "Connection refused" / "timed out"      | `Retryable`          |
/// | stderr contains "Resource temporarily unavailable"      | `Retryable`          |
/// | stderr contains "Principal does not exist"              | `FatalForPrincipal`  |
/// | stderr contains "insufficient permission" / "Unauthorized" | `FatalForPrincipal` |
/// | stderr contains "Password is in dictionary" / policy violation | `FatalForPrincipal` |
/// | any other non-zero exit                                 | `Retryable` (unrecognized failures default to retryable so a transient blip on an unfamiliar KDC build never wedges a principal forever) |
pub struct ShellKdcAdmin {
    tool: KdcTool,
    call_timeout: Duration,
}

impl ShellKdcAdmin {
    pub fn new(tool: KdcTool) -> Self {
        Self {
            tool,
            call_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    async fn run_query(&self, query: &str) -> Result<Output, String> {
        let mut cmd = self.tool.command();
        cmd.args(self.tool.base_args());
        cmd.arg("-q").arg(query);

        let output = tokio::time::timeout(self.call_timeout, cmd.output())
            .await
            .map_err(|_| format!("kadmin call timed out after {:?}", self.call_timeout))?
            .map_err(|e| format!("failed to spawn kadmin: {e}"))?;
        Ok(output)
    }

    fn classify_set_password(output: &Output) -> SetPasswordOutcome {
        if output.status.success() {
            return SetPasswordOutcome::Ok;
        }
        let stderr = String::from_utf8_lossy(&output.stderr);

        const RETRYABLE_MARKERS: &[&str] = &[
            "Cannot contact any KDC",
            "Connection refused",
            "timed out",
            "Resource temporarily unavailable",
        ];
        const FATAL_MARKERS: &[&str] = &[
            "Principal does not exist",
            "insufficient permission",
            "Unauthorized",
            "Password is in dictionary",
            "Password is too short",
        ];

        if FATAL_MARKERS.iter().any(|m| stderr.contains(m)) {
            return SetPasswordOutcome::FatalForPrincipal {
                reason: stderr.trim().to_owned(),
            };
        }
        if RETRYABLE_MARKERS.iter().any(|m| stderr.contains(m)) {
            return SetPasswordOutcome::Retryable {
                reason: stderr.trim().to_owned(),
            };
        }
        SetPasswordOutcome::Retryable {
            reason: format!("unrecognized kadmin failure: {}", stderr.trim()),
        }
    }

    /// Parses the key version number out of a `getprinc <principal>`
    /// transcript, from its `Key: vno N, ...` line.
    fn parse_kvno(getprinc_output: &str) -> Option<u32> {
        getprinc_output.lines().find_map(|line| {
            let rest = line.trim().strip_prefix("Key: vno ")?;
            let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
            digits.parse().ok()
        })
    }
}

#[async_trait]
impl KdcAdmin for ShellKdcAdmin {
    async fn set_password(&self, principal: &str, password: &str) -> SetPasswordOutcome {
        let query = format!("cpw -pw {password} {principal}");
        match self.run_query(&query).await {
            Ok(output) => Self::classify_set_password(&output),
            Err(reason) => SetPasswordOutcome::Retryable { reason },
        }
    }

    async fn extract_keytab(&self, principal: &str) -> Result<KeytabBlob, String> {
        let mut suffix = [0u8; 8];
        rand::rngs::OsRng.fill_bytes(&mut suffix);
        let tmp_path = std::env::temp_dir().join(format!("broker-{}.keytab", hex::encode(suffix)));

        let ktadd_query = format!("ktadd -k {} -norandkey {}", tmp_path.display(), principal);
        let output = self.run_query(&ktadd_query).await?;
        if !output.status.success() {
            return Err(format!(
                "ktadd failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }

        let bytes = tokio::fs::read(&tmp_path)
            .await
            .map_err(|e| format!("failed to read extracted keytab: {e}"))?;
        let _ = tokio::fs::remove_file(&tmp_path).await;

        let getprinc_query = format!("getprinc {principal}");
        let getprinc_output = self.run_query(&getprinc_query).await?;
        let stdout = String::from_utf8_lossy(&getprinc_output.stdout);
        let kvno = Self::parse_kvno(&stdout)
            .ok_or_else(|| format!("could not parse KVNO from getprinc output for {principal}"))?;

        Ok(KeytabBlob { bytes, kvno })
    }
}

/// Caps the number of `set_password`/`extract_keytab` calls in flight
/// against a wrapped [`KdcAdmin`]. Each rotator task acquires a permit for
/// the duration of one call; a bound of 1 serializes every call against the
/// KDC.
pub struct ConcurrencyLimitedKdcAdmin {
    inner: std::sync::Arc<dyn KdcAdmin>,
    semaphore: tokio::sync::Semaphore,
}

impl ConcurrencyLimitedKdcAdmin {
    pub fn new(inner: std::sync::Arc<dyn KdcAdmin>, max_in_flight: usize) -> Self {
        Self {
            inner,
            semaphore: tokio::sync::Semaphore::new(max_in_flight.max(1)),
        }
    }
}

#[async_trait]
impl KdcAdmin for ConcurrencyLimitedKdcAdmin {
    async fn set_password(&self, principal: &str, password: &str) -> SetPasswordOutcome {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .expect("semaphore is never closed");
        self.inner.set_password(principal, password).await
    }

    async fn extract_keytab(&self, principal: &str) -> Result<KeytabBlob, String> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .expect("semaphore is never closed");
        self.inner.extract_keytab(principal).await
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn classifies_connection_refused_as_retryable() {
        let output = Output {
            status: std::os::unix::process::ExitStatusExt::from_raw(1 << 8),
            stdout: vec![],
            stderr: b"kadmin: Connection refused while initializing kadmin interface".to_vec(),
        };
        assert!(matches!(
            ShellKdcAdmin::classify_set_password(&output),
            SetPasswordOutcome::Retryable { .. }
        ));
    }

    #[test]
    fn classifies_unknown_principal_as_fatal() {
        let output = Output {
            status: std::os::unix::process::ExitStatusExt::from_raw(1 << 8),
            stdout: vec![],
            stderr: b"change_password: Principal does not exist while changing password".to_vec(),
        };
        assert!(matches!(
            ShellKdcAdmin::classify_set_password(&output),
            SetPasswordOutcome::FatalForPrincipal { .. }
        ));
    }

    #[test]
    fn unrecognized_failure_defaults_to_retryable() {
        let output = Output {
            status: std::os::unix::process::ExitStatusExt::from_raw(1 << 8),
            stdout: vec![],
            stderr: b"kadmin: something we've never seen before".to_vec(),
        };
        assert!(matches!(
            ShellKdcAdmin::classify_set_password(&output),
            SetPasswordOutcome::Retryable { .. }
        ));
    }

    #[test]
    fn parses_kvno_from_getprinc_transcript() {
        let transcript = "Principal: HTTP/svc@EXAMPLE.COM\n\
             Expiration date: [never]\n\
             Key: vno 7, aes256-cts-hmac-sha1-96\n";
        assert_eq!(ShellKdcAdmin::parse_kvno(transcript), Some(7));
    }

    #[test]
    fn missing_kvno_line_parses_to_none() {
        assert_eq!(ShellKdcAdmin::parse_kvno("Principal: nothing here\n"), None);
    }

    struct AlwaysOkKdc;

    #[async_trait]
    impl KdcAdmin for AlwaysOkKdc {
        async fn set_password(&self, _principal: &str, _password: &str) -> SetPasswordOutcome {
            SetPasswordOutcome::Ok
        }

        async fn extract_keytab(&self, _principal: &str) -> Result<KeytabBlob, String> {
            Ok(KeytabBlob {
                bytes: vec![1, 2, 3],
                kvno: 1,
            })
        }
    }

    #[tokio::test]
    async fn concurrency_limited_admin_still_delegates_correctly() {
        let admin = ConcurrencyLimitedKdcAdmin::new(std::sync::Arc::new(AlwaysOkKdc), 1);
        assert_eq!(
            admin.set_password("p", "pw").await,
            SetPasswordOutcome::Ok
        );
        let blob = admin.extract_keytab("p").await.unwrap();
        assert_eq!(blob.kvno, 1);
    }
}
