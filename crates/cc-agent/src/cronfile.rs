use anyhow::{bail, Context, Result};
use cc_core::protocol::{ExecutionMode, JobDefinition};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

pub const FALLBACK_SELF_PATH: &str = "/usr/local/bin/cc-agent";

const CRON_HEADER: &str = "# CronCommander managed cron jobs\n\
# Do not edit this file manually\n\
SHELL=/bin/bash\n\
PATH=/usr/local/bin:/usr/bin:/bin\n\n";

/// POSIX single-quote escaping: wrap in `'...'`, rewrite each embedded `'`
/// as `'\''`. The empty string becomes `''`.
pub fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        return "''".to_string();
    }
    let mut quoted = String::with_capacity(s.len() + 2);
    quoted.push('\'');
    for ch in s.chars() {
        if ch == '\'' {
            quoted.push_str("'\\''");
        } else {
            quoted.push(ch);
        }
    }
    quoted.push('\'');
    quoted
}

fn contains_line_break(s: &str) -> bool {
    s.contains('\n') || s.contains('\r')
}

/// Renders the scheduler file for a job set.
///
/// The cron expression is emitted verbatim in the schedule field; every
/// other job-supplied value is single-quote escaped, and the user command
/// runs under `/bin/sh -c` so its metacharacters are interpreted by a shell
/// inside the scheduled invocation rather than by cron's line parser. A job
/// carrying a newline in any field could smuggle extra cron lines, so it is
/// dropped whole.
pub fn render_cron_file(
    jobs: &[JobDefinition],
    mode: ExecutionMode,
    self_path: &Path,
    socket_path: &Path,
) -> String {
    let mut out = String::with_capacity(CRON_HEADER.len() + jobs.len() * 100);
    out.push_str(CRON_HEADER);

    for job in jobs {
        if contains_line_break(&job.job_id)
            || contains_line_break(&job.cron_expression)
            || contains_line_break(&job.command)
        {
            warn!(
                event = "job_rejected",
                job_id = %job.job_id.escape_debug(),
                reason = "line break in job fields"
            );
            continue;
        }

        out.push_str(&job.cron_expression);
        out.push(' ');
        if mode.is_system() {
            // No per-job user assignment yet; system-mode jobs run as root.
            out.push_str("root ");
        }
        out.push_str(&self_path.to_string_lossy());
        out.push_str(" exec --job-id ");
        out.push_str(&shell_quote(&job.job_id));
        // The socket path travels on the command line so the wrapper finds
        // the daemon no matter which user context cron applies.
        out.push_str(" --socket-path ");
        out.push_str(&shell_quote(&socket_path.to_string_lossy()));
        out.push_str(" -- /bin/sh -c ");
        out.push_str(&shell_quote(&job.command));
        out.push('\n');
    }
    out
}

pub fn self_executable_path() -> PathBuf {
    std::env::current_exe().unwrap_or_else(|_| PathBuf::from(FALLBACK_SELF_PATH))
}

/// Replaces the local schedule with a job set. System mode rewrites the cron
/// spool file atomically; user mode pipes the rendering into `crontab -`.
/// Each call replaces the entire prior set.
pub async fn apply_job_set(
    jobs: &[JobDefinition],
    mode: ExecutionMode,
    self_path: &Path,
    socket_path: &Path,
    cron_file_path: &Path,
) -> Result<()> {
    let content = render_cron_file(jobs, mode, self_path, socket_path);
    match mode {
        ExecutionMode::System => {
            let target = cron_file_path.to_path_buf();
            let job_count = jobs.len();
            tokio::task::spawn_blocking(move || install_system_file(&content, &target))
                .await
                .context("cron install task failed")??;
            info!(event = "system_cron_updated", jobs = job_count);
        }
        ExecutionMode::User => {
            install_user_crontab(&content).await?;
            info!(event = "user_crontab_updated", jobs = jobs.len());
        }
    }
    Ok(())
}

/// Writes `<target>.tmp` then renames over the target, so cron only ever
/// observes the prior file or the full new one. Both paths share a
/// filesystem, which makes the rename atomic; a failed rename leaves the
/// prior file untouched and removes the tmp file.
fn install_system_file(content: &str, target: &Path) -> Result<()> {
    use std::fs;

    let mut tmp = target.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    fs::write(&tmp, content)
        .with_context(|| format!("failed to write cron tmp file {}", tmp.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&tmp, fs::Permissions::from_mode(0o644))
            .with_context(|| format!("failed to chmod cron tmp file {}", tmp.display()))?;
    }

    if let Err(err) = fs::rename(&tmp, target) {
        let _ = fs::remove_file(&tmp);
        return Err(err)
            .with_context(|| format!("failed to replace cron file {}", target.display()));
    }
    Ok(())
}

async fn install_user_crontab(content: &str) -> Result<()> {
    let mut child = tokio::process::Command::new("crontab")
        .arg("-")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .context("failed to spawn crontab")?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(content.as_bytes())
            .await
            .context("failed to feed crontab")?;
    }

    let output = child
        .wait_with_output()
        .await
        .context("failed to wait for crontab")?;
    if !output.status.success() {
        bail!(
            "crontab exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(id: &str, schedule: &str, command: &str) -> JobDefinition {
        JobDefinition {
            job_id: id.to_string(),
            cron_expression: schedule.to_string(),
            command: command.to_string(),
        }
    }

    fn render(jobs: &[JobDefinition], mode: ExecutionMode) -> String {
        render_cron_file(
            jobs,
            mode,
            Path::new("/usr/local/bin/cc-agent"),
            Path::new("/var/lib/croncommander/cc-agent.sock"),
        )
    }

    #[test]
    fn quotes_match_posix_single_quote_rules() {
        let cases = [
            ("", "''"),
            ("simple", "'simple'"),
            ("hello world", "'hello world'"),
            ("don't", "'don'\\''t'"),
            ("'quoted'", "''\\''quoted'\\'''"),
            ("!@#$%^&*()", "'!@#$%^&*()'"),
            (
                "string-with-'single'-quotes-and-spaces",
                "'string-with-'\\''single'\\''-quotes-and-spaces'",
            ),
        ];
        for (input, expected) in cases {
            assert_eq!(shell_quote(input), expected, "input {input:?}");
        }
    }

    /// Minimal POSIX-shell unquoting (single-quoted regions plus backslash
    /// escapes between them), enough to check that parsing the emitted form
    /// yields the original string back.
    fn shell_unquote(quoted: &str) -> String {
        let mut out = String::new();
        let mut chars = quoted.chars();
        while let Some(ch) = chars.next() {
            match ch {
                '\'' => loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(inner) => out.push(inner),
                        None => panic!("unterminated quote in {quoted:?}"),
                    }
                },
                '\\' => match chars.next() {
                    Some(escaped) => out.push(escaped),
                    None => panic!("dangling backslash in {quoted:?}"),
                },
                other => panic!("unexpected unquoted char {other:?} in {quoted:?}"),
            }
        }
        out
    }

    #[test]
    fn quote_round_trips_through_a_shell_parser() {
        for input in [
            "",
            "plain",
            "don't",
            "''''",
            "a'b'c",
            "spaces and\ttabs",
            "$HOME `cmd` $(sub) ; & | > <",
            "unicode: żółć 漢字",
        ] {
            assert_eq!(shell_unquote(&shell_quote(input)), input, "input {input:?}");
        }
    }

    #[test]
    fn renders_header_and_user_mode_line() {
        let output = render(&[job("j1", "*/5 * * * *", "echo hi")], ExecutionMode::User);
        assert!(output.starts_with(
            "# CronCommander managed cron jobs\n# Do not edit this file manually\nSHELL=/bin/bash\nPATH=/usr/local/bin:/usr/bin:/bin\n\n"
        ));
        assert!(output.contains(
            "*/5 * * * * /usr/local/bin/cc-agent exec --job-id 'j1' --socket-path '/var/lib/croncommander/cc-agent.sock' -- /bin/sh -c 'echo hi'\n"
        ));
        assert!(!output.contains(" root "));
    }

    #[test]
    fn system_mode_inserts_root_between_schedule_and_binary() {
        let output = render(&[job("j1", "0 3 * * *", "echo hi")], ExecutionMode::System);
        assert!(output.contains(
            "0 3 * * * root /usr/local/bin/cc-agent exec --job-id 'j1'"
        ));
    }

    #[test]
    fn jobs_with_line_breaks_are_dropped_whole() {
        let jobs = [
            job("safe-job", "*/5 * * * *", "echo safe"),
            job(
                "malicious-command",
                "* * * * *",
                "echo hello\n* * * * * root echo 'pwned'",
            ),
            job(
                "malicious-schedule",
                "* * * * *\n* * * * * root echo 'pwned'",
                "echo hello",
            ),
            job("job\rid", "* * * * *", "echo hello"),
        ];
        let output = render(&jobs, ExecutionMode::System);

        assert!(output.contains("safe-job"));
        assert!(!output.contains("pwned"));
        assert!(!output.contains("malicious-command"));
        assert!(!output.contains("malicious-schedule"));
        assert!(!output.contains("job\rid"));
        // The only schedule lines are the safe job's.
        let job_lines: Vec<_> = output
            .lines()
            .filter(|line| !line.starts_with('#') && !line.is_empty() && !line.contains('='))
            .collect();
        assert_eq!(job_lines.len(), 1);
    }

    #[test]
    fn embedded_quotes_stay_inside_the_quoted_region() {
        let output = render(
            &[job("q", "* * * * *", "echo 'don't panic'")],
            ExecutionMode::User,
        );
        assert!(output.contains("/bin/sh -c 'echo '\\''don'\\''t panic'\\'''"));
    }

    #[tokio::test]
    async fn system_apply_replaces_file_atomically() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let cron_path = tmp.path().join("croncommander");
        std::fs::write(&cron_path, "stale contents").expect("seed file");

        apply_job_set(
            &[job("j1", "*/5 * * * *", "echo hi")],
            ExecutionMode::System,
            Path::new("/usr/local/bin/cc-agent"),
            Path::new("/tmp/cc-agent.sock"),
            &cron_path,
        )
        .await
        .expect("apply");

        let written = std::fs::read_to_string(&cron_path).expect("read cron file");
        assert!(written.contains("echo hi"));
        assert!(!written.contains("stale contents"));
        assert!(!cron_path.with_extension("tmp").exists());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&cron_path)
                .expect("stat")
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o644);
        }
    }

    #[tokio::test]
    async fn failed_install_leaves_prior_file_untouched() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let missing_dir = tmp.path().join("no-such-dir");
        let cron_path = missing_dir.join("croncommander");

        let err = apply_job_set(
            &[job("j1", "*/5 * * * *", "echo hi")],
            ExecutionMode::System,
            Path::new("/usr/local/bin/cc-agent"),
            Path::new("/tmp/cc-agent.sock"),
            &cron_path,
        )
        .await
        .expect_err("write into missing dir must fail");
        assert!(err.to_string().contains("cron"));
        assert!(!missing_dir.exists());
    }
}
