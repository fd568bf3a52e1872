use crate::errors::*;
use rand::rngs::OsRng;
use rand::RngCore;

/// Tag length accepted by the docker daemon.
pub const MAX_TAG_LEN: usize = 128;

const TMP_REF_PREFIX: &str = "kbld:";

/// Replaces every character outside `[A-Za-z0-9_.-]` with `-`.
pub fn clean_str(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// Truncates to at most `n` characters, cutting from the right.
pub fn trim_str(s: &str, n: usize) -> String {
    s.chars().take(n).collect()
}

pub fn check_len(s: String, n: usize) -> Result<String> {
    if s.len() > n {
        bail!("Expected string {s:?} to be at most {n} characters");
    }
    Ok(s)
}

pub fn check_tag_len128(s: String) -> Result<String> {
    check_len(s, MAX_TAG_LEN)
}

/// 50 lowercase hex characters from the OS entropy source.
pub fn random_str50() -> Result<String> {
    let mut buf = [0u8; 25];
    OsRng
        .try_fill_bytes(&mut buf)
        .context("Failed to gather entropy for image tag")?;
    Ok(hex::encode(buf))
}

/// Tag used to hold a just-built image: `kbld:<rand50>-<clean(image)>`.
pub fn tmp_build_ref(image: &str) -> Result<String> {
    let rand = random_str50()?;
    let body = format!("{rand}-{}", trim_str(&clean_str(image), 50));
    Ok(format!("{TMP_REF_PREFIX}{}", check_tag_len128(body)?))
}

/// Stable tag derived from the image id, `kbld:<clean(image)>-<clean(id)>`.
/// Image hint goes first so `docker images` output groups by image.
pub fn stable_build_ref(image: &str, image_id: &str) -> Result<String> {
    let body = format!(
        "{}-{}",
        trim_str(&clean_str(image), 50),
        check_len(clean_str(image_id), 72)?
    );
    Ok(format!("{TMP_REF_PREFIX}{}", check_tag_len128(body)?))
}
