//! Emoji used by the terminal UI, with plain-text fallbacks.

use console::Emoji;

// Run outcome
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "[OK]");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "[ERR]");
pub static STOP: Emoji<'_, '_> = Emoji("⏹️  ", "[STOP]");
pub static SPARKLE: Emoji<'_, '_> = Emoji("✨ ", "*");

// Phases
pub static SEARCH: Emoji<'_, '_> = Emoji("🔍 ", "[D]");
pub static RECORD: Emoji<'_, '_> = Emoji("🎬 ", "[R]");
pub static WRITE: Emoji<'_, '_> = Emoji("📝 ", "[G]");
pub static RUNNING: Emoji<'_, '_> = Emoji("▶️  ", "[>]");
pub static HEAL: Emoji<'_, '_> = Emoji("🩹 ", "[H]");
