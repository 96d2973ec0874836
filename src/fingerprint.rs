use sha2::{Digest, Sha256};

/// Content-addressed identifier for a piece of listing content.
///
/// Stable under image reordering and under case/whitespace differences in the
/// text; changes whenever the title, the description or the set of image
/// references changes.
pub fn fingerprint(title: &str, description: &str, image_refs: &[String]) -> String {
    let mut image_hashes = image_refs
        .iter()
        .map(|image| image.trim().to_lowercase())
        .filter(|image| !image.is_empty())
        .map(|image| sha256_hex(image.as_bytes()))
        .collect::<Vec<_>>();
    image_hashes.sort();

    let material = format!(
        "{}\n{}\n{}",
        normalize_text(title),
        normalize_text(description),
        image_hashes.join("\n")
    );
    sha256_hex(material.as_bytes())
}

pub fn normalize_text(value: &str) -> String {
    value
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn refs(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn digest_is_lowercase_hex_sha256() {
        let fp = fingerprint("a", "b", &[]);
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|ch| ch.is_ascii_hexdigit() && !ch.is_ascii_uppercase()));
    }

    #[test]
    fn image_order_does_not_matter() {
        let a = fingerprint("t", "d", &refs(&["https://x/1.jpg", "https://x/2.jpg"]));
        let b = fingerprint("t", "d", &refs(&["https://x/2.jpg", "https://x/1.jpg"]));
        assert_eq!(a, b);
    }

    #[test]
    fn text_case_and_whitespace_do_not_matter() {
        let a = fingerprint("Vintage  Lamp", "Works\tfine.\n", &[]);
        let b = fingerprint("  vintage lamp", "works fine.", &[]);
        assert_eq!(a, b);
    }

    #[test]
    fn image_refs_are_trimmed_lowercased_and_blank_ones_ignored() {
        let a = fingerprint("t", "d", &refs(&[" HTTPS://X/1.JPG ", "", "   "]));
        let b = fingerprint("t", "d", &refs(&["https://x/1.jpg"]));
        assert_eq!(a, b);
    }

    #[test]
    fn content_changes_change_the_fingerprint() {
        let base = fingerprint("t", "d", &refs(&["https://x/1.jpg"]));
        assert_ne!(base, fingerprint("t2", "d", &refs(&["https://x/1.jpg"])));
        assert_ne!(base, fingerprint("t", "d2", &refs(&["https://x/1.jpg"])));
        assert_ne!(base, fingerprint("t", "d", &[]));
        assert_ne!(
            base,
            fingerprint("t", "d", &refs(&["https://x/1.jpg", "https://x/2.jpg"]))
        );
    }

    #[test]
    fn title_and_description_boundaries_are_distinct() {
        assert_ne!(fingerprint("ab", "c", &[]), fingerprint("a", "bc", &[]));
    }

    #[test]
    fn used_iphone_scenario_is_stable() {
        let first = fingerprint(
            "Used iPhone 15",
            "Great condition with charger.",
            &refs(&["b.jpg", "a.jpg"]),
        );
        let second = fingerprint(
            "Used iPhone 15",
            "  Great   condition\nwith charger. ",
            &refs(&["a.jpg", "b.jpg"]),
        );
        assert_eq!(first, second);
    }
}
