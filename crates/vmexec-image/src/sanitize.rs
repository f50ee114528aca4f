//! Content-addressed naming for cached rootfs artifacts.

/// Derive a filesystem-safe `image_id` from an OCI image reference.
///
/// The reference is split into a repository part and a tag: the tag is
/// whatever follows the last `:` that appears after the last `/` (so a
/// registry port like `myregistry.io:5000/nginx` is not mistaken for a
/// tag separator); an absent tag defaults to `latest`. Both halves are then
/// lower-cased and every byte outside `[a-z0-9._-]` — including a registry
/// port's `:` — is replaced with `-`. The result is a pure function of the
/// input string: two callers sanitising the same reference always agree.
pub fn sanitize(image_ref: &str) -> String {
    let (repo, tag) = split_repo_tag(image_ref);
    format!("{}-{}", sanitize_component(repo), sanitize_component(tag))
}

fn split_repo_tag(image_ref: &str) -> (&str, &str) {
    let last_slash = image_ref.rfind('/');
    let search_from = last_slash.map(|i| i + 1).unwrap_or(0);
    match image_ref[search_from..].rfind(':') {
        Some(rel_colon) => {
            let colon = search_from + rel_colon;
            (&image_ref[..colon], &image_ref[colon + 1..])
        }
        None => (image_ref, "latest"),
    }
}

fn sanitize_component(s: &str) -> String {
    s.to_lowercase()
        .chars()
        .map(|c| match c {
            'a'..='z' | '0'..='9' | '.' | '_' | '-' => c,
            _ => '-',
        })
        .collect()
}
