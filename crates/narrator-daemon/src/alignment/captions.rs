use std::sync::LazyLock;

use regex::Regex;

use super::AlignmentSpan;

static SRT_TIMESTAMP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d{2}:\d{2}:\d{2}),(\d{3})")
        .unwrap_or_else(|err| panic!("invalid timestamp pattern: {err}"))
});

/// `HH:MM:SS<sep>mmm`. Hours widen past two digits rather than wrapping.
pub fn format_timestamp(ms: u64, separator: char) -> String {
    let hours = ms / 3_600_000;
    let minutes = (ms / 60_000) % 60;
    let seconds = (ms / 1000) % 60;
    let millis = ms % 1000;
    format!("{hours:02}:{minutes:02}:{seconds:02}{separator}{millis:03}")
}

/// One cue per span with 1-based indices. Line breaks inside a span's text
/// are folded so they cannot end the cue early.
pub fn to_srt(spans: &[AlignmentSpan]) -> String {
    let mut out = String::new();
    for (i, span) in spans.iter().enumerate() {
        let text = span.text.split_whitespace().collect::<Vec<_>>().join(" ");
        out.push_str(&format!(
            "{}\n{} --> {}\n{}\n\n",
            i + 1,
            format_timestamp(span.start_ms, ','),
            format_timestamp(span.end_ms, ','),
            text
        ));
    }
    out
}

/// Header plus the SRT cues with `.` as the millisecond separator. Cue
/// indices are kept; WebVTT reads them as cue identifiers.
pub fn srt_to_vtt(srt: &str) -> String {
    let normalized = srt.replace("\r\n", "\n");
    let body = SRT_TIMESTAMP.replace_all(normalized.trim(), "$1.$2");
    if body.is_empty() {
        return "WEBVTT\n".to_string();
    }
    format!("WEBVTT\n\n{body}\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps() {
        assert_eq!(format_timestamp(0, ','), "00:00:00,000");
        assert_eq!(format_timestamp(3_723_004, '.'), "01:02:03.004");
    }

    #[test]
    fn srt_cues_are_numbered_from_one() {
        let spans = vec![
            AlignmentSpan {
                start_ms: 0,
                end_ms: 1_000,
                text: "Hello".into(),
            },
            AlignmentSpan {
                start_ms: 1_000,
                end_ms: 2_500,
                text: "Two\n\nlines".into(),
            },
        ];
        assert_eq!(
            to_srt(&spans),
            "1\n00:00:00,000 --> 00:00:01,000\nHello\n\n\
             2\n00:00:01,000 --> 00:00:02,500\nTwo lines\n\n"
        );
    }

    #[test]
    fn vtt_conversion_only_touches_timestamps() {
        let srt = "1\n00:00:01,000 --> 00:00:02,500\nHello\n\n";
        assert_eq!(
            srt_to_vtt(srt),
            "WEBVTT\n\n1\n00:00:01.000 --> 00:00:02.500\nHello\n"
        );

        let commas = "1\n00:00:00,000 --> 00:00:01,000\nWell, hello\n\n";
        assert!(srt_to_vtt(commas).contains("Well, hello"));
    }

    #[test]
    fn empty_srt_is_a_bare_header() {
        assert_eq!(srt_to_vtt(""), "WEBVTT\n");
    }
}
