//! Writes a starter user-database file for verse-server.

use clap::{App, Arg};
use serde_json::json;
use std::fs;
use std::process;

pub fn main() {
    let matches = App::new("Verse User Generator")
        .version("0.1.0")
        .about("Writes a starter users.json for the verse server.")
        .arg(
            Arg::with_name("OUTPUT")
                .help("Path of the user database file to write")
                .default_value("users.json"),
        )
        .get_matches();

    let path = matches.value_of("OUTPUT").unwrap();

    let users = json!({
        "singer": {
            "password": "verse4ever",
            "user_id": 1001,
            "real_name": "A. Singer"
        },
        "drummer": {
            "password": "offbeat",
            "user_id": 1002,
            "real_name": "B. Drummer"
        }
    });

    let serialized = serde_json::to_string_pretty(&users).expect("Error serializing user records");

    if let Err(error) = fs::write(path, serialized) {
        eprintln!("Error writing {}: {}", path, error);
        process::exit(1);
    }

    println!("Wrote {}", path);
}
