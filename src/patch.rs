use crate::error::Result;
use crate::runner::{Runner, TargetRef};
use crate::sandbox::CommandResult;
use std::io::Write;
use tracing::{debug, warn};

/// In-target path for a freshly generated patch file.
pub fn patch_destination() -> String {
    let suffix: [u8; 4] = rand::random();
    format!("/patch_{}.patch", hex::encode(suffix))
}

/// Write `patch` to a temporary file, copy it into `target` and apply it with
/// `git apply`. The local file is removed whatever the outcome; the command
/// result is returned unchanged.
pub async fn apply_patch(
    runner: &Runner,
    target: &TargetRef,
    patch: &str,
) -> Result<CommandResult> {
    let mut local = tempfile::Builder::new()
        .prefix("kodo-")
        .suffix(".patch")
        .tempfile()?;
    local.write_all(patch.as_bytes())?;
    local.flush()?;

    let dest = patch_destination();
    debug!(name = %target.name, dest = %dest, "copying patch");
    runner.copy_to(target, local.path(), &dest).await?;

    let result = runner
        .execute_command(target, &format!("git apply --whitespace=fix {}", dest))
        .await;
    if let Err(e) = local.close() {
        warn!(error = %e, "failed to remove local patch file");
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use regex::Regex;

    #[test]
    fn test_patch_destination_format() {
        let re = Regex::new(r"^/patch_[0-9a-f]{8}\.patch$").unwrap();
        let a = patch_destination();
        assert!(re.is_match(&a));
        assert_ne!(a, patch_destination());
    }
}
