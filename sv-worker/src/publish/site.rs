//! Static site builds
//!
//! `build_site` refreshes the JSON indexes and CVE pages, then invokes the
//! external builder as a child process. The last 64 KiB of each stream and
//! the exit code land in the job result either way; a non-zero exit fails
//! the job with the tails still visible.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::Path;
use std::process::Stdio;
use sv_common::{Error, Result};
use tokio::process::Command;
use tracing::{info, warn};

use crate::db::cves;
use crate::publish::{indexes, markdown};
use crate::worker::{JobContext, JobHandler};

/// How much of each output stream is kept on the job row.
const TAIL_BYTES: usize = 64 * 1024;

/// Handler for `build_site`.
pub struct BuildSiteHandler;

#[async_trait]
impl JobHandler for BuildSiteHandler {
    async fn run(&self, ctx: &JobContext) -> Result<Value> {
        let paths = &ctx.config.paths;
        let site_src = Path::new(&paths.site_src_dir);

        // Refresh the artifacts the builder consumes.
        indexes::write_all_indexes(&ctx.pool, site_src).await?;
        let mut cve_pages = 0usize;
        for cve in cves::list_cves(&ctx.pool).await? {
            ctx.check_canceled()?;
            markdown::write_cve_markdown(&cve, site_src)?;
            cve_pages += 1;
        }

        let publishing = &ctx.config.publishing;
        let mut command = Command::new(&publishing.builder_cmd);
        command
            .arg("-s")
            .arg(&paths.site_src_dir)
            .arg("-d")
            .arg(&paths.site_public_dir)
            .arg("--cacheDir")
            .arg(&paths.site_cache_dir)
            .arg("--gc")
            .arg("--cleanDestinationDir");
        if publishing.minify {
            command.arg("--minify");
        }
        if !publishing.base_url.is_empty() {
            command.arg("--baseURL").arg(&publishing.base_url);
        }
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        info!(cmd = %publishing.builder_cmd, "site build starting");
        let child = command
            .spawn()
            .map_err(|e| Error::Permanent(format!("builder spawn failed: {e}")))?;

        // kill_on_drop terminates the child if the cancel signal wins.
        let output = ctx
            .cancelable(async {
                child
                    .wait_with_output()
                    .await
                    .map_err(|e| Error::Internal(format!("builder wait failed: {e}")))
            })
            .await?;

        let stdout_tail = tail(&output.stdout);
        let stderr_tail = tail(&output.stderr);
        let exit_code = output.status.code().unwrap_or(-1);
        let result = json!({
            "exit_code": exit_code,
            "stdout_tail": stdout_tail,
            "stderr_tail": stderr_tail,
            "cve_pages": cve_pages,
        });

        // Persist the tails now so they survive however the row settles.
        crate::queue::update_job_result(&ctx.pool, &ctx.job.id, &result).await?;

        if exit_code != 0 {
            warn!(exit_code, "site build failed");
            return Err(Error::Permanent(format!("builder exited with {exit_code}")));
        }

        // A successful build must actually have produced a site.
        let index_html = Path::new(&paths.site_public_dir).join("index.html");
        if !index_html.exists() {
            return Err(Error::Permanent(format!(
                "builder exited 0 but {} is missing",
                index_html.display()
            )));
        }

        info!(exit_code, "site build succeeded");
        Ok(result)
    }
}

fn tail(bytes: &[u8]) -> String {
    let start = bytes.len().saturating_sub(TAIL_BYTES);
    String::from_utf8_lossy(&bytes[start..]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_keeps_last_bytes() {
        let data = vec![b'a'; TAIL_BYTES + 100];
        let out = tail(&data);
        assert_eq!(out.len(), TAIL_BYTES);
    }

    #[test]
    fn tail_of_short_output_is_whole() {
        assert_eq!(tail(b"hello"), "hello");
    }
}
