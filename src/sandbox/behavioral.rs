use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{SandboxConfig, SandboxError};

/// Inline seccomp policy for the OS sandbox. Used when no external policy
/// file is deployed next to the sandbox binary. Syscalls are grouped into
/// allowed, logged (these produce the `[SYSCALL]` stderr stream we parse),
/// EPERM-returning, and killed sets; anything unknown kills the process.
pub const INLINE_SECCOMP_POLICY: &str = r#"
POLICY malware_sandbox {
  ALLOW {
    read, write, pread64, pwrite64, readv, writev,
    open, openat, openat2, close, close_range,
    stat, fstat, lstat, newfstatat, statx,
    lseek, dup, dup2, dup3, fcntl, ioctl,
    mmap, munmap, mprotect, mremap, brk, madvise, mincore, msync,
    exit, exit_group, getpid, getppid, gettid,
    getuid, geteuid, getgid, getegid, getresuid, getresgid,
    rt_sigreturn, rt_sigprocmask, rt_sigaction, rt_sigsuspend,
    getcwd, chdir, getdents64,
    clock_gettime, gettimeofday, time, nanosleep, clock_nanosleep,
    select, pselect6, poll, ppoll,
    epoll_create, epoll_create1, epoll_ctl, epoll_wait, epoll_pwait,
    access, faccessat, faccessat2, readlink, readlinkat,
    set_tid_address, arch_prctl,
    getrlimit, prlimit64, getrusage,
    futex, set_robust_list, get_robust_list
  },

  LOG {
    socket, connect, bind, listen, accept, accept4,
    sendto, recvfrom, sendmsg, recvmsg, shutdown, setsockopt,
    execve, execveat, fork, vfork, clone, clone3,
    ptrace, process_vm_readv, process_vm_writev,
    unlink, unlinkat, rmdir, rename, renameat, mkdir, mkdirat,
    chmod, fchmod, chown, fchown, truncate, ftruncate
  },

  ERRNO(1) {
    setuid, setgid, setreuid, setregid,
    setresuid, setresgid, setfsuid, setfsgid, capset,
    mount, umount2, pivot_root, chroot, unshare, setns
  },

  KILL {
    reboot, kexec_load, init_module, delete_module,
    ioperm, iopl, syslog, quotactl
  },

  DEFAULT KILL
}
"#;

/// 16 behavioral counters across five categories, plus the derived
/// composite score and its human-readable evidence list.
#[derive(Debug, Clone, Default)]
pub struct BehavioralMetrics {
    // File system behavior
    pub file_operations: u32,
    pub temp_file_creates: u32,
    pub hidden_file_creates: u32,
    pub executable_drops: u32,

    // Process & execution
    pub process_operations: u32,
    pub self_modification_attempts: u32,
    pub persistence_mechanisms: u32,

    // Network behavior
    pub network_operations: u32,
    pub outbound_connections: u32,
    pub dns_queries: u32,
    pub http_requests: u32,

    // System & registry (Windows-origin, kept for parity)
    pub registry_operations: u32,
    pub service_modifications: u32,
    pub privilege_escalation_attempts: u32,

    // Memory behavior
    pub memory_operations: u32,
    pub code_injection_attempts: u32,

    pub threat_score: f32,
    pub suspicious_behaviors: Vec<String>,

    pub execution_time: Duration,
    pub timed_out: bool,
    pub exit_code: i32,
}

/// Which syscall categories feed the metrics.
#[derive(Debug, Clone, Copy)]
pub struct SyscallFilter {
    pub monitor_file_ops: bool,
    pub monitor_process_ops: bool,
    pub monitor_network_ops: bool,
    pub monitor_registry_ops: bool,
    pub monitor_memory_ops: bool,
}

impl Default for SyscallFilter {
    fn default() -> Self {
        Self {
            monitor_file_ops: true,
            monitor_process_ops: true,
            monitor_network_ops: true,
            monitor_registry_ops: true,
            monitor_memory_ops: true,
        }
    }
}

/// One parsed `[SYSCALL] name(args...)` line from the sandbox stderr.
#[derive(Debug, Clone, PartialEq)]
pub struct SyscallEvent {
    pub name: String,
    pub args: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AnalyzerStats {
    pub total_analyses: u64,
    pub timeouts: u64,
    pub crashes: u64,
    pub average_execution_time: Duration,
    pub max_execution_time: Duration,
}

static SANDBOX_DIR_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Tier 2: execute the file inside an OS sandbox with syscall tracing and
/// derive a behavioral threat score from what it actually does.
///
/// When no sandbox binary is configured (or it is missing on disk) the
/// analyzer falls back to deterministic static heuristics so the pipeline
/// still produces a behavioral signal.
pub struct BehavioralAnalyzer {
    config: SandboxConfig,
    filter: SyscallFilter,
    use_mock: bool,
    stats: Mutex<AnalyzerStats>,
}

impl BehavioralAnalyzer {
    pub fn new(config: SandboxConfig) -> Self {
        Self::with_filter(config, SyscallFilter::default())
    }

    pub fn with_filter(config: SandboxConfig, filter: SyscallFilter) -> Self {
        let use_mock = match &config.sandbox_binary {
            Some(path) => !path.exists(),
            None => true,
        };
        if use_mock {
            info!("behavioral analyzer running in heuristic mode (no sandbox binary)");
        }
        Self {
            config,
            filter,
            use_mock,
            stats: Mutex::new(AnalyzerStats::default()),
        }
    }

    pub fn statistics(&self) -> AnalyzerStats {
        *self.stats.lock()
    }

    pub fn reset_statistics(&self) {
        *self.stats.lock() = AnalyzerStats::default();
    }

    pub async fn analyze(
        &self,
        data: &[u8],
        filename: &str,
        timeout: Duration,
    ) -> Result<BehavioralMetrics, SandboxError> {
        let start = Instant::now();

        let mut metrics = if self.use_mock {
            self.analyze_heuristic(data)
        } else {
            self.analyze_sandboxed(data, filename, timeout).await?
        };

        metrics.execution_time = start.elapsed();
        metrics.threat_score = calculate_threat_score(&metrics);
        metrics.suspicious_behaviors = generate_suspicious_behaviors(&metrics);

        let mut stats = self.stats.lock();
        stats.total_analyses += 1;
        if metrics.timed_out {
            stats.timeouts += 1;
        }
        if metrics.exit_code != 0 {
            stats.crashes += 1;
        }
        let n = stats.total_analyses;
        stats.average_execution_time =
            (stats.average_execution_time * (n as u32 - 1) + metrics.execution_time) / n as u32;
        stats.max_execution_time = stats.max_execution_time.max(metrics.execution_time);
        drop(stats);

        debug!(
            "behavioral analysis of '{filename}' done in {:?}: score {:.2}, {} behaviors",
            metrics.execution_time,
            metrics.threat_score,
            metrics.suspicious_behaviors.len()
        );
        Ok(metrics)
    }

    // ---- Real sandbox path ----

    async fn analyze_sandboxed(
        &self,
        data: &[u8],
        filename: &str,
        timeout: Duration,
    ) -> Result<BehavioralMetrics, SandboxError> {
        let sandbox_bin = self
            .config
            .sandbox_binary
            .clone()
            .ok_or_else(|| SandboxError::Behavioral("no sandbox binary configured".into()))?;

        let work_dir = create_sandbox_dir()?;
        let result = self
            .run_in_sandbox(&sandbox_bin, &work_dir, data, filename, timeout)
            .await;
        if let Err(e) = std::fs::remove_dir_all(&work_dir) {
            warn!("failed to remove sandbox dir {}: {e}", work_dir.display());
        }
        result
    }

    async fn run_in_sandbox(
        &self,
        sandbox_bin: &Path,
        work_dir: &Path,
        data: &[u8],
        filename: &str,
        timeout: Duration,
    ) -> Result<BehavioralMetrics, SandboxError> {
        let exe_path = write_sample(work_dir, data, filename)?;

        let mut command = Command::new(sandbox_bin);
        command
            .arg("--really-quiet")
            .arg("--seccomp-string")
            .arg(INLINE_SECCOMP_POLICY)
            .arg("--time-limit")
            .arg(timeout.as_secs().max(1).to_string())
            .arg("--")
            .arg(&exe_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| SandboxError::Behavioral(format!("failed to launch sandbox: {e}")))?;

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SandboxError::Behavioral("sandbox stderr not captured".into()))?;
        let mut lines = BufReader::new(stderr).lines();

        let mut metrics = BehavioralMetrics::default();
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    match line {
                        Ok(Some(line)) => {
                            if let Some(event) = parse_syscall_event(&line) {
                                self.update_metrics_from_syscall(&event, &mut metrics);
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!("sandbox stderr read failed: {e}");
                            break;
                        }
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    // Budget exhausted: kill the sandbox and keep whatever
                    // evidence was observed so far.
                    metrics.timed_out = true;
                    let _ = child.start_kill();
                    break;
                }
            }
        }

        match tokio::time::timeout(Duration::from_secs(2), child.wait()).await {
            Ok(Ok(status)) => metrics.exit_code = status.code().unwrap_or(-1),
            Ok(Err(e)) => warn!("sandbox wait failed: {e}"),
            Err(_) => {
                let _ = child.start_kill();
                metrics.exit_code = -1;
            }
        }

        Ok(metrics)
    }

    fn update_metrics_from_syscall(&self, event: &SyscallEvent, metrics: &mut BehavioralMetrics) {
        let name = event.name.as_str();
        let args = event.args.as_str();

        if self.filter.monitor_file_ops {
            match name {
                "open" | "openat" | "openat2" | "creat" | "read" | "write" | "unlink"
                | "unlinkat" | "rename" | "renameat" | "mkdir" | "mkdirat" | "chmod"
                | "fchmod" | "truncate" | "ftruncate" => {
                    metrics.file_operations += 1;

                    if matches!(name, "open" | "openat" | "openat2" | "creat" | "mkdir" | "mkdirat")
                        && (args.contains("/tmp/") || args.contains("%TEMP%"))
                    {
                        metrics.temp_file_creates += 1;
                    }
                    if args.contains("/.") {
                        metrics.hidden_file_creates += 1;
                    }
                    if matches!(name, "open" | "openat" | "creat" | "rename" | "renameat" | "chmod")
                        && (args.contains(".exe") || args.contains(".sh") || args.contains(".bat"))
                    {
                        metrics.executable_drops += 1;
                    }
                }
                _ => {}
            }
        }

        if self.filter.monitor_process_ops {
            match name {
                "execve" | "execveat" | "fork" | "vfork" | "clone" | "clone3" => {
                    metrics.process_operations += 1;
                }
                "ptrace" | "process_vm_readv" | "process_vm_writev" => {
                    metrics.code_injection_attempts += 1;
                }
                "setuid" | "setgid" | "setreuid" | "setresuid" | "capset" => {
                    metrics.privilege_escalation_attempts += 1;
                }
                _ => {}
            }
            if args.contains("crontab") || args.contains(".bashrc") || args.contains("systemd") {
                metrics.persistence_mechanisms += 1;
            }
        }

        if self.filter.monitor_network_ops {
            match name {
                "socket" | "connect" | "bind" | "listen" | "accept" | "accept4" | "sendto"
                | "recvfrom" | "sendmsg" | "recvmsg" | "shutdown" | "setsockopt" => {
                    metrics.network_operations += 1;
                    if name == "connect" {
                        metrics.outbound_connections += 1;
                        if args.contains(":53") {
                            metrics.dns_queries += 1;
                        }
                        if args.contains(":80") || args.contains(":443") {
                            metrics.http_requests += 1;
                        }
                    }
                }
                _ => {}
            }
        }

        if self.filter.monitor_memory_ops {
            match name {
                "mmap" | "munmap" | "mremap" | "brk" => metrics.memory_operations += 1,
                "mprotect" => {
                    metrics.memory_operations += 1;
                    if args.contains("PROT_EXEC") {
                        metrics.self_modification_attempts += 1;
                    }
                }
                _ => {}
            }
        }
    }

    // ---- Heuristic (mock) path ----

    /// Static stand-in for execution: counters synthesized from magic
    /// bytes and embedded strings. Deterministic so identical inputs
    /// always produce identical verdicts.
    fn analyze_heuristic(&self, data: &[u8]) -> BehavioralMetrics {
        let mut metrics = BehavioralMetrics::default();
        let content = String::from_utf8_lossy(data);

        // File system signals
        if data.starts_with(b"MZ") {
            metrics.file_operations = 8;
            metrics.executable_drops = 1;
        } else if data.starts_with(b"\x7fELF") {
            metrics.file_operations = 6;
        }
        if content.contains("/tmp/") || content.contains("%TEMP%") {
            metrics.temp_file_creates = 4;
        }
        if content.contains("hidden") || content.contains("/.") {
            metrics.hidden_file_creates = 1;
        }

        // Process signals
        let process_hits = ["CreateProcess", "exec", "fork"]
            .iter()
            .filter(|k| content.contains(**k))
            .count() as u32;
        metrics.process_operations = process_hits * 3;
        if content.contains("VirtualProtect") || content.contains("mprotect") {
            metrics.self_modification_attempts = 1;
        }
        if content.contains("crontab") || content.contains("Startup") || content.contains("RunOnce") {
            metrics.persistence_mechanisms = 2;
        }

        // Network signals
        let network_hits = ["socket", "connect", "send"]
            .iter()
            .filter(|k| content.contains(**k))
            .count() as u32;
        metrics.network_operations = network_hits * 3;

        let mut outbound = 0u32;
        if content.contains("192.168.") {
            outbound += 1;
        }
        if content.contains("10.") {
            outbound += 1;
        }
        if content.contains("http://") {
            outbound += 2;
        }
        if content.contains("https://") {
            outbound += 1;
        }
        metrics.outbound_connections = outbound;

        let dns_hits = [".com", ".org", ".net"]
            .iter()
            .filter(|k| content.contains(**k))
            .count() as u32;
        metrics.dns_queries = dns_hits * 2;

        let http_hits = ["GET ", "POST ", "User-Agent"]
            .iter()
            .filter(|k| content.contains(**k))
            .count() as u32;
        metrics.http_requests = http_hits * 2;

        // Registry / service signals
        let registry_hits = ["RegSetValue", "RegCreateKey", "HKEY_"]
            .iter()
            .filter(|k| content.contains(**k))
            .count() as u32;
        metrics.registry_operations = registry_hits * 3;
        if content.contains("CreateService") || content.contains("sc create") {
            metrics.service_modifications = 1;
        }
        if content.contains("setuid") || content.contains("sudo ") {
            metrics.privilege_escalation_attempts = 1;
        }

        // Memory signals
        let memory_hits = ["VirtualAlloc", "mmap", "mprotect"]
            .iter()
            .filter(|k| content.contains(**k))
            .count() as u32;
        metrics.memory_operations = memory_hits * 3;
        if content.contains("ptrace") || content.contains("WriteProcessMemory") {
            metrics.code_injection_attempts = 1;
        }

        metrics.exit_code = 0;
        metrics
    }
}

fn create_sandbox_dir() -> std::io::Result<PathBuf> {
    let id = SANDBOX_DIR_COUNTER.fetch_add(1, Ordering::Relaxed);
    let dir = std::env::temp_dir().join(format!(
        "sentinel-sandbox-{}-{}",
        std::process::id(),
        id
    ));
    std::fs::create_dir_all(&dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700))?;
    }
    Ok(dir)
}

fn write_sample(dir: &Path, data: &[u8], filename: &str) -> std::io::Result<PathBuf> {
    // Only the basename is trusted; the sample always lands inside `dir`.
    let basename = Path::new(filename)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "sample".to_string());
    let path = dir.join(basename);
    std::fs::write(&path, data)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
    }
    Ok(path)
}

/// Parse one `[SYSCALL] name(args...)` stderr line.
pub fn parse_syscall_event(line: &str) -> Option<SyscallEvent> {
    let rest = line.trim().strip_prefix("[SYSCALL]")?.trim_start();
    let open_paren = rest.find('(')?;
    let name = rest[..open_paren].trim();
    if name.is_empty() || !name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_') {
        return None;
    }

    let after = &rest[open_paren + 1..];
    let args = after.strip_suffix(')').unwrap_or(after);

    Some(SyscallEvent {
        name: name.to_string(),
        args: args.to_string(),
    })
}

/// Bucket the 16 counters into five weighted categories.
/// Weights: filesystem 0.25, process 0.25, network 0.25, system 0.15,
/// memory 0.10; each category sub-score saturates at 1.0.
pub fn calculate_threat_score(metrics: &BehavioralMetrics) -> f32 {
    let mut score = 0.0f32;

    let mut file_score = 0.0f32;
    if metrics.file_operations > 10 {
        file_score += 0.3;
    }
    if metrics.temp_file_creates > 3 {
        file_score += 0.3;
    }
    if metrics.hidden_file_creates > 0 {
        file_score += 0.2;
    }
    if metrics.executable_drops > 0 {
        file_score += 0.2;
    }
    score += file_score.min(1.0) * 0.25;

    let mut process_score = 0.0f32;
    if metrics.process_operations > 5 {
        process_score += 0.3;
    }
    if metrics.self_modification_attempts > 0 {
        process_score += 0.4;
    }
    if metrics.persistence_mechanisms > 0 {
        process_score += 0.3;
    }
    score += process_score.min(1.0) * 0.25;

    let mut network_score = 0.0f32;
    if metrics.network_operations > 5 {
        network_score += 0.2;
    }
    if metrics.outbound_connections > 3 {
        network_score += 0.3;
    }
    if metrics.dns_queries > 5 {
        network_score += 0.2;
    }
    if metrics.http_requests > 5 {
        network_score += 0.3;
    }
    score += network_score.min(1.0) * 0.25;

    let mut system_score = 0.0f32;
    if metrics.registry_operations > 5 {
        system_score += 0.3;
    }
    if metrics.service_modifications > 0 {
        system_score += 0.4;
    }
    if metrics.privilege_escalation_attempts > 0 {
        system_score += 0.3;
    }
    score += system_score.min(1.0) * 0.15;

    let mut memory_score = 0.0f32;
    if metrics.memory_operations > 5 {
        memory_score += 0.5;
    }
    if metrics.code_injection_attempts > 0 {
        memory_score += 0.5;
    }
    score += memory_score.min(1.0) * 0.10;

    score.clamp(0.0, 1.0)
}

/// The evidence list mirrors the exact thresholds used for scoring so
/// every point of the score is explainable.
pub fn generate_suspicious_behaviors(metrics: &BehavioralMetrics) -> Vec<String> {
    let mut behaviors = Vec::new();

    if metrics.file_operations > 10 {
        behaviors.push(format!("Excessive file operations: {}", metrics.file_operations));
    }
    if metrics.temp_file_creates > 3 {
        behaviors.push(format!("Multiple temp file creations: {}", metrics.temp_file_creates));
    }
    if metrics.hidden_file_creates > 0 {
        behaviors.push(format!("Hidden file creation: {}", metrics.hidden_file_creates));
    }
    if metrics.executable_drops > 0 {
        behaviors.push(format!("Executable dropped: {}", metrics.executable_drops));
    }

    if metrics.process_operations > 5 {
        behaviors.push(format!("Multiple process spawns: {}", metrics.process_operations));
    }
    if metrics.self_modification_attempts > 0 {
        behaviors.push("Self-modification detected (possible packer/obfuscation)".to_string());
    }
    if metrics.persistence_mechanisms > 0 {
        behaviors.push("Persistence mechanism installed (autostart/cron)".to_string());
    }

    if metrics.network_operations > 5 {
        behaviors.push(format!("Network activity: {} operations", metrics.network_operations));
    }
    if metrics.outbound_connections > 3 {
        behaviors.push(format!("Multiple outbound connections: {}", metrics.outbound_connections));
    }
    if metrics.dns_queries > 5 {
        behaviors.push(format!("Suspicious DNS queries: {}", metrics.dns_queries));
    }

    if metrics.registry_operations > 5 {
        behaviors.push("Registry modifications detected".to_string());
    }
    if metrics.service_modifications > 0 {
        behaviors.push("Service/daemon modification attempted".to_string());
    }
    if metrics.privilege_escalation_attempts > 0 {
        behaviors.push("Privilege escalation attempted".to_string());
    }
    if metrics.code_injection_attempts > 0 {
        behaviors.push("Code injection detected".to_string());
    }

    // Composite malware shapes
    if detect_ransomware_pattern(metrics) {
        behaviors.push("Ransomware-like mass file modification pattern".to_string());
    }
    if detect_keylogger_pattern(metrics) {
        behaviors.push("Keylogger-like capture-and-exfiltrate pattern".to_string());
    }
    if detect_cryptominer_pattern(metrics) {
        behaviors.push("Cryptominer-like network beaconing pattern".to_string());
    }
    if detect_process_injector_pattern(metrics) {
        behaviors.push("Process injection pattern".to_string());
    }

    behaviors
}

pub fn detect_ransomware_pattern(metrics: &BehavioralMetrics) -> bool {
    metrics.file_operations > 10
        && metrics.executable_drops > 0
        && (metrics.temp_file_creates > 3 || metrics.hidden_file_creates > 0)
}

pub fn detect_keylogger_pattern(metrics: &BehavioralMetrics) -> bool {
    metrics.hidden_file_creates > 0 && metrics.network_operations > 5 && metrics.http_requests > 0
}

pub fn detect_cryptominer_pattern(metrics: &BehavioralMetrics) -> bool {
    metrics.outbound_connections > 3 && metrics.dns_queries > 5 && metrics.memory_operations > 5
}

pub fn detect_process_injector_pattern(metrics: &BehavioralMetrics) -> bool {
    metrics.code_injection_attempts > 0 && metrics.memory_operations > 5
}
