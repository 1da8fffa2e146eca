use std::sync::Arc;

use common::{LimitsConfig, LlmConfig};
use contentblast::formats::{parse_formats, Format};
use contentblast::llm::remote::RemoteLlmProvider;
use contentblast::repurpose::Repurposer;

/// Smoke test against a live completion API: `try_repurpose [format ...]`
#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();
    dotenv::dotenv().ok();

    let llm = LlmConfig::default();
    let api_key = llm
        .api_key()
        .expect("Set OPENAI_API_KEY environment variable");
    let base_url = llm.resolve_api_url();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let formats = if args.is_empty() {
        Format::ALL.into_iter().collect()
    } else {
        parse_formats(&args).unwrap_or_else(|e| {
            eprintln!("{}", e);
            std::process::exit(2);
        })
    };

    println!("\n{}", "=".repeat(60));
    println!("Testing repurposing");
    println!("Base URL: {}", base_url);
    println!("Model: {}", llm.model);
    println!("{}", "=".repeat(60));

    let provider = RemoteLlmProvider::new(&base_url, &api_key, &llm.model).with_defaults(
        llm.timeout_seconds,
        llm.max_tokens,
        llm.temperature,
    );
    let repurposer = Repurposer::from_config(Arc::new(provider), &llm, &LimitsConfig::default());

    let article = r#"
Rust is a systems programming language that runs blazingly fast, prevents
segfaults, and guarantees thread safety. It accomplishes these goals through
a unique ownership system that enforces memory safety without requiring a
garbage collector.

Many companies are adopting Rust for critical infrastructure, including
Mozilla, Dropbox, and Microsoft.
    "#;

    let estimate = repurposer.estimate_cost(article);
    println!("\nEstimated tokens: {}", estimate.estimated_tokens);

    match repurposer.repurpose(article, &formats, "article").await {
        Ok(result) => {
            println!("✓ Success! ({} tokens, model {})", result.tokens_used, result.model);
            for (format, text) in &result.formats {
                println!("\n--- {} ---\n{}", format, text);
            }
            if !result.hashtags.is_empty() {
                println!("\nHashtags: {}", result.hashtags.join(" "));
            }
        }
        Err(e) => {
            eprintln!("✗ Failed: {}", e);
        }
    }

    println!("\n{}", "=".repeat(60));
}
