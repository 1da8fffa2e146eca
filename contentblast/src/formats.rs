use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Supported social media output types
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    Twitter,
    Linkedin,
    Instagram,
    Email,
    Tiktok,
    Youtube,
}

#[derive(Debug, Error, PartialEq)]
#[error("unknown format '{0}' (expected one of: twitter, linkedin, instagram, email, tiktok, youtube)")]
pub struct UnknownFormat(pub String);

impl Format {
    pub const ALL: [Format; 6] = [
        Format::Twitter,
        Format::Linkedin,
        Format::Instagram,
        Format::Email,
        Format::Tiktok,
        Format::Youtube,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Format::Twitter => "twitter",
            Format::Linkedin => "linkedin",
            Format::Instagram => "instagram",
            Format::Email => "email",
            Format::Tiktok => "tiktok",
            Format::Youtube => "youtube",
        }
    }

    /// Other keys a model may use for this format (older prompt layout and common spellings).
    pub fn aliases(&self) -> &'static [&'static str] {
        match self {
            Format::Twitter => &["twitter_threads", "twitter_thread", "tweets", "x"],
            Format::Linkedin => &["linkedin_post"],
            Format::Instagram => &["instagram_captions", "instagram_caption"],
            Format::Email => &["email_newsletter", "newsletter"],
            Format::Tiktok => &["tiktok_scripts", "tiktok_script"],
            Format::Youtube => &["youtube_description"],
        }
    }

    /// Matches the canonical name or any alias, ignoring case.
    pub fn matches_key(&self, key: &str) -> bool {
        let key = key.trim();
        key.eq_ignore_ascii_case(self.as_str())
            || self.aliases().iter().any(|a| key.eq_ignore_ascii_case(a))
    }

    /// Tone rule given to the model for this platform.
    pub fn guidance(&self) -> &'static str {
        match self {
            Format::Twitter => "Twitter/X: Short, punchy, use hooks, a thread of up to 5 tweets, max 280 chars each",
            Format::Linkedin => "LinkedIn: Professional, insightful, storytelling",
            Format::Instagram => "Instagram: Casual, engaging, emoji-friendly, up to 3 caption variants",
            Format::Email => "Email: Personal, value-focused, clear CTA, with a subject line",
            Format::Tiktok => "TikTok: Trendy, hook-first, conversational, up to 2 short scripts",
            Format::Youtube => "YouTube: Descriptive, keyword-rich video description with a CTA",
        }
    }

    /// JSON value shape the model should produce for this format.
    pub fn json_shape(&self) -> &'static str {
        match self {
            Format::Twitter => r#"["tweet1", "tweet2", "tweet3", "tweet4", "tweet5"]"#,
            Format::Linkedin => r#""full linkedin post here""#,
            Format::Instagram => r#"["caption1", "caption2", "caption3"]"#,
            Format::Email => r#"{"subject": "email subject", "body": "email body"}"#,
            Format::Tiktok => r#"["script1", "script2"]"#,
            Format::Youtube => r#""youtube description""#,
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Format {
    type Err = UnknownFormat;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Format::ALL
            .into_iter()
            .find(|f| f.matches_key(s))
            .ok_or_else(|| UnknownFormat(s.trim().to_string()))
    }
}

/// Parse caller-supplied names into a set; duplicates collapse.
pub fn parse_formats<I, S>(names: I) -> Result<BTreeSet<Format>, UnknownFormat>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    names.into_iter().map(|n| n.as_ref().parse()).collect()
}
