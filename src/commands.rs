//! Example command set: radio-control style commands.
//!
//! Each argument-taking command acknowledges with `<Label> set to <value>`
//! or returns a placeholder when no argument is given. `help` enumerates
//! every registered name; `version` reports the package version.

use crate::dispatch::CommandTable;

/// Commands that take an argument, paired with their response label.
const ARG_COMMANDS: [(&str, &str); 9] = [
    ("transmit", "Transmit"),
    ("call", "Call"),
    ("grid", "Grid"),
    ("power", "Power"),
    ("freq", "Freq"),
    ("ppm", "PPM"),
    ("selfcal", "SelfCal"),
    ("offset", "Offset"),
    ("led", "LED"),
];

/// Build the example command table.
pub fn example_commands() -> CommandTable {
    let mut builder = CommandTable::builder();

    for (name, label) in ARG_COMMANDS {
        builder = builder.command(name, move |arg| {
            if arg.is_empty() {
                format!("{label} <example response>")
            } else {
                format!("{label} set to {arg}")
            }
        });
    }

    builder = builder
        .command("port", |_| "Port <example response>".to_string())
        .command("xmit", |_| "Xmit <example response>".to_string())
        .command("version", |_| {
            concat!("Version ", env!("CARGO_PKG_VERSION")).to_string()
        });

    let listing = {
        let mut names: Vec<String> = builder.names().to_vec();
        names.push("help".to_string());
        format!("Available commands: {}", names.join(", "))
    };

    builder.command("help", move |_| listing.clone()).build()
}
