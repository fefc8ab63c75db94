use colored::*;
use std::fmt::Display;

fn status(prefix: ColoredString, message: impl Display) {
    eprintln!("{prefix} {message}");
}

pub fn print_error(message: impl Display) {
    status("Error:".red().bold(), message);
}

pub fn print_success(message: impl Display) {
    status("✓".green().bold(), message);
}

pub fn print_warning(message: impl Display) {
    status("⚠".yellow().bold(), message);
}

pub fn print_info(message: impl Display) {
    status("ℹ".blue().bold(), message);
}
