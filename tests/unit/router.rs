use channel_relay::config::{ChannelEntry, DestinationConfig};
use channel_relay::router::Router;
use channel_relay::types::{DestinationKind, InboundMessage, OriginKind, TransformConfig};
use chrono::Utc;
use std::borrow::Cow;

fn destination(name: &str, kind: DestinationKind, channels: Vec<ChannelEntry>) -> DestinationConfig {
    DestinationConfig {
        name: name.to_string(),
        kind,
        address: format!("https://{name}.test/hook"),
        channels,
    }
}

fn entry(id: &str, keywords: &[&str]) -> ChannelEntry {
    ChannelEntry {
        id: id.to_string(),
        keywords: keywords.iter().map(|k| k.to_string()).collect(),
        ..ChannelEntry::default()
    }
}

fn chat(channel_id: &str, name: &str, text: &str) -> InboundMessage {
    InboundMessage::new(OriginKind::ChatChannel, channel_id, name, "analyst", Utc::now(), text)
}

#[test]
fn test_keyword_match_and_unconditional_destination() {
    let router = Router::new(vec![
        destination("A", DestinationKind::Discord, vec![entry("@alerts", &["ransomware"])]),
        destination("B", DestinationKind::Slack, vec![entry("@alerts", &[])]),
    ]);
    let msg = chat("-1001", "@alerts", "New RANSOMWARE campaign");

    let routed = router.route(&msg);
    assert_eq!(routed.len(), 2);
    assert_eq!(routed[0].name, "A");
    assert_eq!(routed[0].kind, DestinationKind::Discord);
    assert_eq!(routed[0].matched_keywords, vec!["ransomware"]);
    assert_eq!(routed[1].name, "B");
    assert!(routed[1].matched_keywords.is_empty());
}

#[test]
fn test_keyword_miss_filters_destination() {
    let router = Router::new(vec![
        destination("A", DestinationKind::Discord, vec![entry("@alerts", &["ransomware"])]),
        destination("B", DestinationKind::Slack, vec![entry("@alerts", &[])]),
    ]);
    let routed = router.route(&chat("-1001", "@alerts", "weekly digest"));
    assert_eq!(routed.len(), 1);
    assert_eq!(routed[0].name, "B");
}

#[test]
fn test_matched_keywords_keep_configured_casing() {
    let router = Router::new(vec![destination(
        "A",
        DestinationKind::Discord,
        vec![entry("@alerts", &["CVE-2024", "LockBit", "unrelated"])],
    )]);
    let routed = router.route(&chat("1", "@alerts", "lockbit exploits cve-2024-1234"));
    assert_eq!(routed[0].matched_keywords, vec!["CVE-2024", "LockBit"]);
}

#[test]
fn test_unconfigured_channel_routes_nowhere() {
    let router = Router::new(vec![destination(
        "A",
        DestinationKind::Discord,
        vec![entry("@alerts", &[])],
    )]);
    let msg = chat("-1002", "@other", "hello");
    assert!(router.route(&msg).is_empty());
    assert!(!router.is_configured(&msg));
}

#[test]
fn test_supergroup_id_normalization() {
    let router = Router::new(vec![destination(
        "A",
        DestinationKind::Telegram,
        vec![entry("1234567", &[])],
    )]);
    assert_eq!(router.route(&chat("-1001234567", "x", "hi")).len(), 1);
    assert!(router.route(&chat("-1001234568", "x", "hi")).is_empty());
}

#[test]
fn test_first_matching_entry_wins_per_destination() {
    let strict = ChannelEntry {
        restricted_mode: true,
        ..entry("@alerts", &["malware"])
    };
    let router = Router::new(vec![destination(
        "A",
        DestinationKind::Discord,
        vec![strict, entry("-1005", &[])],
    )]);
    // the first matching entry filters the message out; the second is never consulted
    assert!(router.route(&chat("-1005", "@alerts", "nothing here")).is_empty());

    let routed = router.route(&chat("-1005", "@alerts", "new malware"));
    assert_eq!(routed.len(), 1);
    assert!(routed[0].restricted_mode);
}

#[test]
fn test_ocr_text_searched_only_when_entry_enables_ocr() {
    let with_ocr = ChannelEntry {
        ocr: true,
        ..entry("@alerts", &["invoice"])
    };
    let router = Router::new(vec![
        destination("ocr", DestinationKind::Discord, vec![with_ocr]),
        destination("plain", DestinationKind::Slack, vec![entry("@alerts", &["invoice"])]),
    ]);
    let mut msg = chat("1", "@alerts", "see image");
    msg.ocr_text = Some("INVOICE #42".to_string());

    let routed = router.route(&msg);
    assert_eq!(routed.len(), 1);
    assert_eq!(routed[0].name, "ocr");
    assert!(routed[0].ocr_enabled);
    assert!(router.ocr_requested(&msg));
}

#[test]
fn test_feed_origin_matches_by_url() {
    let feed_url = "https://example.com/feed.xml";
    let router = Router::new(vec![destination(
        "ops",
        DestinationKind::Slack,
        vec![entry(feed_url, &[])],
    )]);
    let msg = InboundMessage::new(OriginKind::Feed, feed_url, "Example", "Example", Utc::now(), "post");
    assert_eq!(router.route(&msg).len(), 1);
}

#[test]
fn test_transform_carried_on_descriptor() {
    let with_parser = ChannelEntry {
        parser: Some(TransformConfig {
            trim_front_lines: 1,
            trim_back_lines: 0,
        }),
        ..entry("@alerts", &[])
    };
    let router = Router::new(vec![destination("A", DestinationKind::Discord, vec![with_parser])]);
    let routed = router.route(&chat("1", "@alerts", "x"));
    assert_eq!(routed[0].transform.unwrap().trim_front_lines, 1);
}

#[test]
fn test_parse_msg_trims_lines() {
    let msg = chat("1", "@alerts", "header\nline one\nline two\nfooter");
    let cfg = TransformConfig {
        trim_front_lines: 1,
        trim_back_lines: 1,
    };
    let parsed = Router::parse_msg(&msg, Some(&cfg));
    assert_eq!(parsed.text, "line one\nline two");
    // the original is untouched
    assert_eq!(msg.text, "header\nline one\nline two\nfooter");
}

#[test]
fn test_parse_msg_without_transform_borrows() {
    let msg = chat("1", "@alerts", "a\nb");
    assert!(matches!(Router::parse_msg(&msg, None), Cow::Borrowed(_)));
    let zero = TransformConfig::default();
    assert!(matches!(Router::parse_msg(&msg, Some(&zero)), Cow::Borrowed(_)));
}

#[test]
fn test_parse_msg_negative_bounds_leave_message() {
    let msg = chat("1", "@alerts", "a\nb\nc");
    let cfg = TransformConfig {
        trim_front_lines: -1,
        trim_back_lines: 1,
    };
    let parsed = Router::parse_msg(&msg, Some(&cfg));
    assert_eq!(parsed.text, "a\nb\nc");
}

#[test]
fn test_parse_msg_trimming_everything_leaves_placeholder() {
    let msg = chat("1", "@alerts", "a\nb\nc");
    let cfg = TransformConfig {
        trim_front_lines: 2,
        trim_back_lines: 1,
    };
    let parsed = Router::parse_msg(&msg, Some(&cfg));
    assert!(!parsed.text.is_empty());
    assert!(parsed.text.contains("2 leading"));
    assert!(parsed.text.contains("1 trailing"));
}

#[test]
fn test_parse_msg_trailing_newline_does_not_count_as_a_line() {
    let msg = chat("1", "@alerts", "only line\n");
    let cfg = TransformConfig {
        trim_front_lines: 1,
        trim_back_lines: 0,
    };
    let parsed = Router::parse_msg(&msg, Some(&cfg));
    assert!(!parsed.text.trim().is_empty());
    assert!(parsed.text.contains("1 leading"));
}

#[test]
fn test_parse_msg_blank_remainder_leaves_placeholder() {
    let msg = chat("1", "@alerts", "header\n\n   \nfooter");
    let cfg = TransformConfig {
        trim_front_lines: 1,
        trim_back_lines: 1,
    };
    let parsed = Router::parse_msg(&msg, Some(&cfg));
    assert!(parsed.text.starts_with("[Message content removed"));
}
