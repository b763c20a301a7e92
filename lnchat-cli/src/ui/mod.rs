//! Terminal output helpers

use colored::Colorize;

use lnchat_node::MessageEnvelope;
use lnchat_store::MessageAggregate;

/// Print a success message
pub fn success(message: &str) {
    println!("{} {}", "✓".green().bold(), message);
}

/// Print an error message
pub fn error(message: &str) {
    eprintln!("{} {}", "✗".red().bold(), message);
}

/// Print an info message
pub fn info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}

/// Print a warning message
pub fn warning(message: &str) {
    println!("{} {}", "⚠".yellow().bold(), message);
}

/// Print a section header
pub fn header(text: &str) {
    println!("\n{}", text.bold().underline());
}

/// Print a key-value pair
pub fn key_value(key: &str, value: &str) {
    println!("  {}: {}", key.cyan(), value);
}

/// Print a separator line
pub fn separator() {
    println!("{}", "─".repeat(60).dimmed());
}

/// One line per message event.
pub fn message(aggregate: &MessageAggregate) {
    let raw = &aggregate.message;
    let from = match (&raw.sender, aggregate.is_incoming()) {
        (_, false) => "me".to_string(),
        (Some(sender), true) => short(&sender.to_string()),
        (None, true) => "anonymous".to_string(),
    };
    let arrow = if aggregate.is_incoming() {
        "←".green().bold()
    } else {
        "→".blue().bold()
    };
    let verified = if aggregate.is_incoming() && raw.sender.is_some() && !raw.signature_verified {
        format!(" {}", "(unverified)".yellow())
    } else {
        String::new()
    };
    let amount = if aggregate.is_incoming() {
        aggregate.amount_received()
    } else {
        aggregate.amount_sent()
    };

    println!(
        "{} [{}] #{} {}{}: {} {}",
        arrow,
        raw.timestamp.format("%H:%M:%S").to_string().dimmed(),
        raw.discussion_id,
        from.bold(),
        verified,
        text(aggregate),
        format!("({} msat)", amount.0).dimmed(),
    );
}

/// Envelope text, or the raw bytes when the payload is not an envelope.
fn text(aggregate: &MessageAggregate) -> String {
    let raw = &aggregate.message.raw_payload;
    MessageEnvelope::decode(raw)
        .map(|env| env.message)
        .unwrap_or_else(|_| String::from_utf8_lossy(raw).into_owned())
}

fn short(address: &str) -> String {
    if address.len() > 16 {
        format!("{}…{}", &address[..8], &address[address.len() - 6..])
    } else {
        address.to_string()
    }
}
