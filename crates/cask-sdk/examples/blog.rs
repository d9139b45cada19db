//! A small blog on top of Cask: authors, tagged posts, an edit, and a
//! deletion, then the queries a blog front page would run.
//!
//! Run with `RUST_LOG=debug` to watch the ingestion pipeline.

use cask_sdk::{schema_envelope, Cask, CaskConfig, EnvelopeBuilder, IndexValue, Timestamp};
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let dir = tempfile::tempdir()?;
    let cask = Cask::open(CaskConfig::in_dir(dir.path()))?;

    let author_schema = cask.seal(schema_envelope("author", &b"{\"name\":\"string\"}"[..]))?;
    let post_schema = cask.seal(schema_envelope(
        "post",
        &b"{\"title\":\"string\",\"tags\":\"[string]\",\"published\":\"timestamp\"}"[..],
    ))?;
    cask.put(&author_schema)?;
    cask.put(&post_schema)?;

    let ada = cask.seal(EnvelopeBuilder::new(author_schema.id(), &b"Ada"[..]).field("name", "ada"))?;
    let grace =
        cask.seal(EnvelopeBuilder::new(author_schema.id(), &b"Grace"[..]).field("name", "grace"))?;
    cask.put(&ada)?;
    cask.put(&grace)?;

    let post = |title: &str, author, tags: Vec<&str>, published: i64| {
        cask.seal(
            EnvelopeBuilder::new(post_schema.id(), title.as_bytes().to_vec())
                .relate("author", author)
                .field("title", title)
                .field("tags", tags)
                .field("published", Timestamp::from_millis(published)),
        )
    };
    let engines = post("Analytical engines", ada.id(), vec!["history", "hardware"], 1_000)?;
    let compilers = post("On compilers", grace.id(), vec!["languages"], 2_000)?;
    let bugs = post("A moth in the relay", grace.id(), vec!["hardware", "debugging"], 3_000)?;
    for envelope in [&engines, &compilers, &bugs] {
        cask.put(envelope)?;
    }

    // Edit: a new version superseding the first post.
    let engines_v2 = cask.seal(
        EnvelopeBuilder::new(post_schema.id(), &b"Analytical engines, revised"[..])
            .previous(engines.id())
            .relate("author", ada.id())
            .field("title", "Analytical engines, revised")
            .field("tags", vec!["history", "hardware", "revised"])
            .field("published", Timestamp::from_millis(4_000)),
    )?;
    cask.put(&engines_v2)?;

    // Delete the compilers post.
    cask.tombstone(&compilers.id())?;

    println!("posts tagged 'hardware', current versions only:");
    for id in cask.find_tagged("tags", "hardware")? {
        if cask.head_of(&id)? != id || cask.is_deleted(&id)? {
            continue;
        }
        let envelope = cask.get(&id)?;
        let author = envelope.targets("author");
        println!(
            "  {} {:?} by {}",
            id.short_hex(),
            String::from_utf8_lossy(envelope.payload()),
            author.first().map(|a| a.short_hex()).unwrap_or_default()
        );
    }

    println!("posts by grace:");
    for id in cask.referrers_via(&grace.id(), "author") {
        let state = if cask.is_deleted(&id)? { "deleted" } else { "live" };
        println!("  {} ({state})", id.short_hex());
    }

    let window = cask.find_range(
        "published",
        IndexValue::Timestamp(Timestamp::from_millis(1_500))..,
    )?;
    println!("published after 1.5s: {} envelopes", window.len());

    println!("history of the engines post:");
    for id in cask.history(&cask.head_of(&engines.id())?)? {
        println!("  {}", id.short_hex());
    }

    let chain = cask.type_chain(&engines_v2.id())?;
    println!("engines_v2 is typed through {} schemas", chain.len());

    let report = cask.compact()?;
    println!(
        "compaction removed {} and retained {} superseded envelopes",
        report.removed.len(),
        report.retained.len()
    );

    Ok(())
}
