use std::collections::BTreeMap;

use serde::Serialize;

pub const EMBED_BLOCK: &str = "core/embed";
pub const PROVIDER_SLUG_ATTR: &str = "providerNameSlug";

/// oEmbed providers the editor exposes as `core/embed` variations: (slug, display name).
pub const EMBED_VARIATIONS: &[(&str, &str)] = &[
    ("youtube", "YouTube"),
    ("vimeo", "Vimeo"),
    ("facebook", "Facebook"),
    ("twitter", "Twitter"),
    ("instagram", "Instagram"),
    ("soundcloud", "SoundCloud"),
    ("spotify", "Spotify"),
    ("flickr", "Flickr"),
    ("imgur", "Imgur"),
    ("dailymotion", "Dailymotion"),
    ("ted", "TED"),
    ("kickstarter", "Kickstarter"),
    ("meetup-com", "Meetup.com"),
    ("mixcloud", "Mixcloud"),
    ("reddit", "Reddit"),
    ("reverbnation", "ReverbNation"),
    ("screencast", "Screencast"),
    ("scribd", "Scribd"),
    ("slideshare", "Slideshare"),
    ("smugmug", "SmugMug"),
    ("tumblr", "Tumblr"),
    ("videopress", "VideoPress"),
    ("wordpress", "WordPress"),
    ("wordpress-tv", "WordPress.tv"),
    ("animoto", "Animoto"),
    ("cloudup", "Cloudup"),
    ("collegehumor", "CollegeHumor"),
    ("crowdsignal", "Crowdsignal"),
    ("issuu", "Issuu"),
    ("pinterest", "Pinterest"),
    ("pocket-casts", "Pocket Casts"),
    ("wolfram", "Wolfram"),
    ("bluesky", "Bluesky"),
    ("tiktok", "TikTok"),
];

/// `core/embed:<slug>`
pub fn embed_identifier(slug: &str) -> String {
    format!("{}:{}", EMBED_BLOCK, slug)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AvailableBlock {
    pub name: String,
    pub title: String,
}

/// Every identifier a mapping can be written against: the embed variations
/// plus whatever identifiers were seen in stored content. Sorted by name.
pub fn available_blocks<I>(seen: I) -> Vec<AvailableBlock>
where
    I: IntoIterator<Item = String>,
{
    let mut blocks: BTreeMap<String, String> = seen
        .into_iter()
        .filter(|name| !name.is_empty())
        .map(|name| (name.clone(), name))
        .collect();

    for (slug, title) in EMBED_VARIATIONS {
        blocks.insert(embed_identifier(slug), format!("{} Embed", title));
    }

    blocks
        .into_iter()
        .map(|(name, title)| AvailableBlock { name, title })
        .collect()
}
