//! Shared UI icons and emojis.

use console::Emoji;

// Status indicators
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "[OK]");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "[ERR]");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "[WARN]");
pub static SKIP: Emoji<'_, '_> = Emoji("⏭️  ", "[SKIP]");
pub static BLOCKER: Emoji<'_, '_> = Emoji("🚧 ", "[BLOCK]");
pub static PENDING: Emoji<'_, '_> = Emoji("⏳ ", "[..]");
pub static SPARKLE: Emoji<'_, '_> = Emoji("✨ ", "*");

// Progress indicators
pub static PROGRESS: Emoji<'_, '_> = Emoji("📊 ", "[PROG]");
pub static PIVOT: Emoji<'_, '_> = Emoji("🔄 ", "[ITER]");
pub static CLOCK: Emoji<'_, '_> = Emoji("⏱️  ", "[T]");
