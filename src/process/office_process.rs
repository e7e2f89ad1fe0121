//! Engine process lifecycle: spawn, liveness, termination, profile dir.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bridge::WorkerAddress;
use crate::error::ProcessError;

use super::retry::RetrySchedule;

/// One managed engine process bound to a fixed worker address.
///
/// The process owns a private profile directory under the configured
/// working directory. The directory is recreated fresh on every start
/// and deleted on stop/restart; it is never shared between instances.
pub struct OfficeProcess {
    address: WorkerAddress,
    engine_binary: PathBuf,
    profile_dir: PathBuf,
    kill_existing: bool,
    child: Option<Child>,
}

impl OfficeProcess {
    /// Creates a launcher for the given address.
    ///
    /// No process is spawned until [`start`](Self::start) is called.
    /// `kill_existing` selects the policy for a stray engine process
    /// found accepting on the address: kill it, or refuse to start.
    pub fn new(
        address: WorkerAddress,
        engine_binary: PathBuf,
        working_dir: &Path,
        kill_existing: bool,
    ) -> Self {
        let profile_dir = working_dir.join(format!(
            ".officepool_{}_{}",
            address.profile_slug(),
            Uuid::new_v4().simple()
        ));
        Self {
            address,
            engine_binary,
            profile_dir,
            kill_existing,
            child: None,
        }
    }

    /// The address this process accepts bridge connections on.
    pub fn address(&self) -> &WorkerAddress {
        &self.address
    }

    /// The private profile directory of this instance.
    pub fn profile_dir(&self) -> &Path {
        &self.profile_dir
    }

    /// OS pid of the running child, if any.
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    /// Whether a process was ever spawned by this instance.
    pub fn is_started(&self) -> bool {
        self.child.is_some()
    }

    /// Liveness probe.
    pub fn is_running(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Spawns the engine process with a fresh profile directory.
    ///
    /// # Errors
    ///
    /// `ProcessError::AlreadyRunning` if the previous child is still
    /// alive, `ProcessError::LaunchFailed` on spawn error.
    pub async fn start(&mut self) -> Result<(), ProcessError> {
        if self.is_running() {
            return Err(ProcessError::AlreadyRunning);
        }

        self.check_existing_process()?;
        self.prepare_profile_dir()?;

        let mut command = self.build_command();
        info!(
            address = %self.address,
            profile_dir = %self.profile_dir.display(),
            "Starting engine process"
        );
        let child = command.spawn().map_err(|source| ProcessError::LaunchFailed {
            command: self.engine_binary.display().to_string(),
            source,
        })?;
        info!(pid = ?child.id(), address = %self.address, "Engine process started");
        self.child = Some(child);
        Ok(())
    }

    /// Accept argument as it appears on the engine command line.
    fn accept_arg(&self) -> String {
        format!("--accept={}", self.address.accept_string())
    }

    /// Refuses to spawn next to a leftover engine on the same address.
    ///
    /// Detection matches the accept argument in process command lines,
    /// so only engine processes are ever considered. Per policy the
    /// stray process is killed or the start fails.
    fn check_existing_process(&self) -> Result<(), ProcessError> {
        let Some(pid) = find_process_with_arg(&self.accept_arg()) else {
            return Ok(());
        };
        if !self.kill_existing {
            return Err(ProcessError::ExistingProcess { pid });
        }
        warn!(
            pid,
            address = %self.address,
            "Killing existing engine process accepting on this address"
        );
        #[cfg(target_family = "unix")]
        {
            let rc = unsafe { libc::kill(pid as i32, libc::SIGKILL) };
            if rc != 0 {
                let err = std::io::Error::last_os_error();
                // Already gone is success.
                if err.raw_os_error() != Some(libc::ESRCH) {
                    return Err(ProcessError::Io(err));
                }
            }
        }
        Ok(())
    }

    /// Builds the headless command line embedding the accept address
    /// and the per-instance profile directory override.
    fn build_command(&self) -> Command {
        let mut command = Command::new(&self.engine_binary);
        command
            .arg(self.accept_arg())
            .arg(format!(
                "-env:UserInstallation={}",
                profile_dir_url(&self.profile_dir)
            ))
            .args([
                "--headless",
                "--invisible",
                "--nocrashreport",
                "--nodefault",
                "--nofirststartwizard",
                "--nolockcheck",
                "--nologo",
                "--norestore",
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        command
    }

    /// Polls for the exit code until it is known or the retry budget
    /// elapses. A process that was never started counts as exited with
    /// code 0.
    pub async fn exit_code(
        &mut self,
        interval: Duration,
        timeout: Duration,
    ) -> Result<i32, ProcessError> {
        let schedule = RetrySchedule::new(interval, timeout);
        loop {
            if let Some(code) = self.try_exit_code()? {
                return Ok(code);
            }
            if schedule.expired() {
                return Err(ProcessError::RetryTimeout { timeout });
            }
            schedule.wait().await;
        }
    }

    /// Non-blocking exit probe. Exit by signal maps to code -1.
    fn try_exit_code(&mut self) -> Result<Option<i32>, ProcessError> {
        match self.child.as_mut() {
            None => Ok(Some(0)),
            Some(child) => Ok(child.try_wait()?.map(|status| status.code().unwrap_or(-1))),
        }
    }

    /// Requests graceful OS termination and polls for exit; escalates
    /// to a forced kill on timeout.
    ///
    /// # Errors
    ///
    /// `ProcessError::TerminationFailed` if the process is still alive
    /// after the forced kill.
    pub async fn terminate(
        &mut self,
        interval: Duration,
        timeout: Duration,
    ) -> Result<i32, ProcessError> {
        info!(
            address = %self.address,
            pid = ?self.pid(),
            "Trying to terminate engine process"
        );
        self.signal_graceful()?;
        match self.exit_code(interval, timeout).await {
            Ok(code) => Ok(code),
            Err(ProcessError::RetryTimeout { .. }) => {
                warn!(
                    address = %self.address,
                    pid = ?self.pid(),
                    "Process ignored graceful termination; killing"
                );
                self.signal_kill()?;
                self.exit_code(interval, timeout).await.map_err(|_| {
                    ProcessError::TerminationFailed(format!(
                        "process at '{}' is still alive after kill",
                        self.address
                    ))
                })
            }
            Err(err) => Err(err),
        }
    }

    /// SIGTERM on unix; on other platforms there is no graceful signal
    /// and the kill request is issued directly.
    fn signal_graceful(&mut self) -> Result<(), ProcessError> {
        #[cfg(target_family = "unix")]
        {
            let Some(pid) = self.pid() else {
                return Ok(());
            };
            let rc = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
            if rc != 0 {
                let err = std::io::Error::last_os_error();
                // Already gone is success.
                if err.raw_os_error() != Some(libc::ESRCH) {
                    return Err(ProcessError::Io(err));
                }
            }
            Ok(())
        }
        #[cfg(not(target_family = "unix"))]
        {
            self.signal_kill()
        }
    }

    fn signal_kill(&mut self) -> Result<(), ProcessError> {
        if let Some(child) = self.child.as_mut() {
            match child.start_kill() {
                Ok(()) => {}
                // Already exited.
                Err(err) if err.kind() == std::io::ErrorKind::InvalidInput => {}
                Err(err) => return Err(ProcessError::Io(err)),
            }
        }
        Ok(())
    }

    /// Deletes any stale profile directory and recreates it empty.
    fn prepare_profile_dir(&self) -> Result<(), ProcessError> {
        if self.profile_dir.exists() {
            warn!(
                dir = %self.profile_dir.display(),
                "Profile dir already exists; deleting"
            );
            self.delete_profile_dir();
        }
        std::fs::create_dir_all(&self.profile_dir)?;
        Ok(())
    }

    /// Best-effort recursive delete of the profile directory.
    ///
    /// On failure the directory is renamed aside so a subsequent start
    /// gets a clean path; failures are logged, never fatal.
    pub fn delete_profile_dir(&self) {
        if !self.profile_dir.exists() {
            return;
        }
        debug!(
            dir = %self.profile_dir.display(),
            "Deleting instance profile directory"
        );
        if let Err(err) = std::fs::remove_dir_all(&self.profile_dir) {
            let millis = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_millis())
                .unwrap_or(0);
            let mut renamed = self.profile_dir.as_os_str().to_owned();
            renamed.push(format!(".old.{}", millis));
            let renamed = PathBuf::from(renamed);
            match std::fs::rename(&self.profile_dir, &renamed) {
                Ok(()) => warn!(
                    error = %err,
                    renamed = %renamed.display(),
                    "Could not delete profile dir; renamed it aside"
                ),
                Err(_) => error!(error = %err, "Could not delete profile dir"),
            }
        }
    }
}

/// Scans the process table for a command line carrying `arg` exactly.
///
/// Only implemented on Linux; elsewhere no existing process is ever
/// reported and the launch proceeds.
#[cfg(target_os = "linux")]
fn find_process_with_arg(arg: &str) -> Option<u32> {
    let own = std::process::id();
    for entry in std::fs::read_dir("/proc").ok()?.flatten() {
        let Some(pid) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<u32>().ok())
        else {
            continue;
        };
        if pid == own {
            continue;
        }
        let Ok(cmdline) = std::fs::read(entry.path().join("cmdline")) else {
            continue;
        };
        if cmdline.split(|byte| *byte == 0).any(|part| part == arg.as_bytes()) {
            return Some(pid);
        }
    }
    None
}

#[cfg(not(target_os = "linux"))]
fn find_process_with_arg(_arg: &str) -> Option<u32> {
    None
}

/// Renders the profile directory as a file URL for the
/// `-env:UserInstallation` override. Everything outside the unreserved
/// set (and the path separator) is percent-encoded.
fn profile_dir_url(path: &Path) -> String {
    use std::fmt::Write as _;

    let mut url = String::from("file://");
    for byte in path.to_string_lossy().bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' | b'/' => {
                url.push(byte as char)
            }
            _ => {
                let _ = write!(url, "%{:02X}", byte);
            }
        }
    }
    url
}

#[cfg(test)]
mod tests {
    use super::*;

    fn socket_address() -> WorkerAddress {
        WorkerAddress::socket(2002)
    }

    #[test]
    fn test_build_command_embeds_address_and_profile() {
        let dir = tempfile::tempdir().expect("tempdir");
        let process = OfficeProcess::new(
            socket_address(),
            PathBuf::from("soffice"),
            dir.path(),
            true,
        );
        let command = process.build_command();
        let args: Vec<String> = command
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();

        assert!(args
            .iter()
            .any(|a| a == "--accept=socket,host=127.0.0.1,port=2002,tcpNoDelay=1;urp"));
        assert!(args
            .iter()
            .any(|a| a.starts_with("-env:UserInstallation=file://")));
        assert!(args.iter().any(|a| a == "--headless"));
        assert!(args.iter().any(|a| a == "--norestore"));
    }

    #[test]
    fn test_profile_dirs_are_unique_per_instance() {
        let dir = tempfile::tempdir().expect("tempdir");
        let a = OfficeProcess::new(socket_address(), PathBuf::from("soffice"), dir.path(), true);
        let b = OfficeProcess::new(socket_address(), PathBuf::from("soffice"), dir.path(), true);
        assert_ne!(a.profile_dir(), b.profile_dir());
    }

    #[test]
    fn test_profile_url_is_percent_encoded() {
        let dir = tempfile::tempdir().expect("tempdir");
        let spaced = dir.path().join("my profiles");
        let process = OfficeProcess::new(
            socket_address(),
            PathBuf::from("soffice"),
            &spaced,
            true,
        );
        let command = process.build_command();
        let env_arg = command
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .find(|a| a.starts_with("-env:UserInstallation=file://"))
            .expect("profile override present");

        assert!(!env_arg.contains(' '));
        assert!(env_arg.contains("my%20profiles"));
    }

    #[tokio::test]
    async fn test_launch_failure() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut process = OfficeProcess::new(
            socket_address(),
            dir.path().join("missing-binary"),
            dir.path(),
            true,
        );
        let err = process.start().await.expect_err("must fail");
        assert!(matches!(err, ProcessError::LaunchFailed { .. }));
        assert!(!process.is_running());
    }

    #[cfg(target_family = "unix")]
    mod unix {
        use super::*;

        use std::os::unix::fs::PermissionsExt;

        /// A stand-in engine that ignores the office flags and stays up.
        fn stub_engine(dir: &Path) -> PathBuf {
            let path = dir.join("stub-engine.sh");
            std::fs::write(&path, "#!/bin/sh\nexec sleep 600\n").expect("write script");
            let mut perms = std::fs::metadata(&path).expect("metadata").permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&path, perms).expect("chmod");
            path
        }

        #[tokio::test]
        async fn test_start_terminate_lifecycle() {
            let dir = tempfile::tempdir().expect("tempdir");
            let binary = stub_engine(dir.path());
            let mut process =
                OfficeProcess::new(WorkerAddress::socket(2101), binary, dir.path(), true);

            process.start().await.expect("start");
            assert!(process.is_running());
            assert!(process.profile_dir().is_dir());

            let err = process.start().await.expect_err("second start must fail");
            assert!(matches!(err, ProcessError::AlreadyRunning));

            process
                .terminate(Duration::from_millis(10), Duration::from_secs(5))
                .await
                .expect("terminate");
            assert!(!process.is_running());

            process.delete_profile_dir();
            assert!(!process.profile_dir().exists());
        }

        #[tokio::test]
        async fn test_exit_code_times_out_while_running() {
            let dir = tempfile::tempdir().expect("tempdir");
            let binary = stub_engine(dir.path());
            let mut process =
                OfficeProcess::new(WorkerAddress::socket(2102), binary, dir.path(), true);

            process.start().await.expect("start");
            let err = process
                .exit_code(Duration::from_millis(10), Duration::from_millis(80))
                .await
                .expect_err("still running");
            assert!(matches!(err, ProcessError::RetryTimeout { .. }));

            process
                .terminate(Duration::from_millis(10), Duration::from_secs(5))
                .await
                .expect("terminate");
        }

        /// Launches a decoy process whose command line carries the
        /// accept argument for `port`, as a leftover engine would.
        #[cfg(target_os = "linux")]
        fn spawn_decoy(dir: &Path, port: u16) -> std::process::Child {
            let binary = stub_engine(dir);
            std::process::Command::new(binary)
                .arg(format!(
                    "--accept={}",
                    WorkerAddress::socket(port).accept_string()
                ))
                .spawn()
                .expect("spawn decoy")
        }

        #[cfg(target_os = "linux")]
        fn wait_for_exit(child: &mut std::process::Child) {
            for _ in 0..100 {
                if matches!(child.try_wait(), Ok(Some(_))) {
                    return;
                }
                std::thread::sleep(Duration::from_millis(20));
            }
            panic!("decoy process never exited");
        }

        #[cfg(target_os = "linux")]
        #[tokio::test]
        async fn test_existing_process_refused_when_kill_disabled() {
            let dir = tempfile::tempdir().expect("tempdir");
            let mut decoy = spawn_decoy(dir.path(), 2104);
            // Give the decoy a moment to land in the process table.
            tokio::time::sleep(Duration::from_millis(50)).await;

            let binary = stub_engine(dir.path());
            let mut process =
                OfficeProcess::new(WorkerAddress::socket(2104), binary, dir.path(), false);
            let err = process.start().await.expect_err("must refuse");
            assert!(matches!(err, ProcessError::ExistingProcess { .. }));
            assert!(!process.is_started());

            decoy.kill().expect("kill decoy");
            wait_for_exit(&mut decoy);
        }

        #[cfg(target_os = "linux")]
        #[tokio::test]
        async fn test_existing_process_killed_per_policy() {
            let dir = tempfile::tempdir().expect("tempdir");
            let mut decoy = spawn_decoy(dir.path(), 2105);
            tokio::time::sleep(Duration::from_millis(50)).await;

            let binary = stub_engine(dir.path());
            let mut process =
                OfficeProcess::new(WorkerAddress::socket(2105), binary, dir.path(), true);
            process.start().await.expect("start");
            assert!(process.is_running());
            wait_for_exit(&mut decoy);

            process
                .terminate(Duration::from_millis(10), Duration::from_secs(5))
                .await
                .expect("terminate");
        }

        #[tokio::test]
        async fn test_exit_code_of_short_lived_process() {
            let dir = tempfile::tempdir().expect("tempdir");
            let path = dir.path().join("exits.sh");
            std::fs::write(&path, "#!/bin/sh\nexit 0\n").expect("write script");
            let mut perms = std::fs::metadata(&path).expect("metadata").permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&path, perms).expect("chmod");

            let mut process =
                OfficeProcess::new(WorkerAddress::socket(2103), path, dir.path(), true);
            process.start().await.expect("start");
            let code = process
                .exit_code(Duration::from_millis(10), Duration::from_secs(5))
                .await
                .expect("exit code");
            assert_eq!(code, 0);
            assert!(!process.is_running());
        }
    }
}
