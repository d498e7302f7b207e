// ABOUTME: `tutorbox fetch` - downloads one bundle from the content server
// ABOUTME: Prints the bundle's files as a table

use anyhow::Result;
use colored::*;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, ContentArrangement, Table};
use tutorbox_core::BundleKind;
use tutorbox_runtime::FilesFetcher;

pub async fn fetch_bundle(bundle: &str, content_url: Option<String>) -> Result<()> {
    let config = super::load_config(content_url)?;
    let fetcher = FilesFetcher::from_config(&config)?;

    let files = fetcher.fetch_bundle(bundle).await?;
    if files.is_empty() {
        println!(
            "{}",
            format!("Bundle '{}' is empty or could not be fetched", bundle).yellow()
        );
        println!("{}", format!("Content server: {}", fetcher.base_url()).dimmed());
        return Ok(());
    }

    println!(
        "{}",
        format!("📦 {} ({})", bundle, BundleKind::from_ref_id(bundle))
            .blue()
            .bold()
    );
    println!();

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic);

    table.set_header(vec!["Path", "Type", "Size"]);
    for (path, content) in &files {
        let kind = if content.is_binary() { "binary" } else { "text" };
        table.add_row(vec![
            path.clone(),
            kind.to_string(),
            format!("{} B", content.len()),
        ]);
    }

    println!("{}", table);
    println!("Total: {} files", files.len().to_string().cyan());

    Ok(())
}
