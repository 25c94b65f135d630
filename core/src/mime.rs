//! First-16-bytes MIME sniffing table.
//!
//! Deliberately small and literal — the signature list is the one named by
//! the external interface, not a general-purpose sniffer. `mime_guess`
//! (extension-based) is consulted first by callers; this is the fallback
//! for extension-less or misleadingly-named files.

/// Extension-based guess from a file name or URL tail, the way the
/// teacher's own streaming handler uses `mime_guess::MimeGuess` before
/// falling back to content sniffing.
pub fn guess_from_name(name: &str) -> Option<String> {
    mime_guess::from_path(name).first().map(|m| m.to_string())
}

pub fn sniff(head: &[u8]) -> Option<&'static str> {
    if head.len() >= 8 && &head[4..8] == b"ftyp" {
        let brand = &head[8..head.len().min(12)];
        let known = [
            b"iso".as_slice(),
            b"mp4".as_slice(),
            b"avc".as_slice(),
            b"M4V".as_slice(),
            b"qt ".as_slice(),
        ];
        if known.iter().any(|b| brand.starts_with(b)) {
            return Some("video/mp4");
        }
    }

    const SIGNATURES: &[(&[u8], &str)] = &[
        (&[0x1A, 0x45, 0xDF, 0xA3], "video/webm"),
        (&[0x46, 0x4C, 0x56], "video/x-flv"),
        (&[0xFF, 0xD8, 0xFF], "image/jpeg"),
        (&[0x89, 0x50, 0x4E, 0x47], "image/png"),
        (&[0x47, 0x49, 0x46, 0x38], "image/gif"),
        (&[0x50, 0x4B, 0x03, 0x04], "application/zip"),
        (&[0x52, 0x61, 0x72, 0x21], "application/x-rar-compressed"),
        (&[0x25, 0x50, 0x44, 0x46], "application/pdf"),
    ];

    SIGNATURES
        .iter()
        .find(|(sig, _)| head.starts_with(sig))
        .map(|(_, mime)| *mime)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sniffs_mp4_ftyp_brands() {
        let mut head = vec![0u8; 16];
        head[4..8].copy_from_slice(b"ftyp");
        head[8..11].copy_from_slice(b"iso");
        assert_eq!(sniff(&head), Some("video/mp4"));
    }

    #[test]
    fn sniffs_png_and_pdf() {
        assert_eq!(sniff(&[0x89, 0x50, 0x4E, 0x47, 0, 0, 0, 0]), Some("image/png"));
        assert_eq!(sniff(&[0x25, 0x50, 0x44, 0x46]), Some("application/pdf"));
    }

    #[test]
    fn unmatched_is_none() {
        assert_eq!(sniff(&[0, 1, 2, 3, 4, 5, 6, 7]), None);
    }

    #[test]
    fn guesses_from_extension() {
        assert_eq!(guess_from_name("movie.mp4").as_deref(), Some("video/mp4"));
        assert_eq!(guess_from_name("no-extension"), None);
    }
}
