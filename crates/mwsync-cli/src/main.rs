//! # MixedWorld Sync CLI
//!
//! Command-line utilities for inspecting ids, topics and payloads.

use anyhow::{Context, Result};
use mwsync_core::NameHash32;
use mwsync_proto::{Envelope, PropertyAddress, TopicFilter, TopicScheme};
use std::env;

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_help();
        return Ok(());
    }

    match args[1].as_str() {
        "hash" => {
            if args.len() < 3 {
                eprintln!("Usage: mwsync hash <text>");
                std::process::exit(1);
            }
            println!("{}", NameHash32::new(&args[2]));
        }
        "topic" => {
            if args.len() < 6 {
                eprintln!("Usage: mwsync topic <root> <object> <class> <property> [main-topic]");
                std::process::exit(1);
            }
            let scheme = args.get(6).map_or_else(TopicScheme::default, |main| TopicScheme::new(main.as_str()));
            let address = PropertyAddress::new(args[2].as_str(), args[3].as_str(), args[4].as_str(), args[5].as_str());
            println!("{}", scheme.property(&address));
        }
        "match" => {
            if args.len() < 4 {
                eprintln!("Usage: mwsync match <filter> <topic>");
                std::process::exit(1);
            }
            let filter = TopicFilter::new(&args[2]).context("Invalid filter")?;
            let matched = filter.matches(&args[3]);
            println!("{matched}");
            if !matched {
                std::process::exit(2);
            }
        }
        "envelope" => {
            if args.len() < 4 {
                eprintln!("Usage: mwsync envelope <peer-id> <json-value>");
                std::process::exit(1);
            }
            let value: serde_json::Value = serde_json::from_str(&args[3]).context("Value is not JSON")?;
            let envelope = Envelope::wrap(args[2].as_str(), false, &value)?;
            println!("{}", serde_json::to_string_pretty(&envelope)?);
        }
        "unwrap" => {
            if args.len() < 3 {
                eprintln!("Usage: mwsync unwrap <envelope-json>");
                std::process::exit(1);
            }
            let envelope = Envelope::from_json(args[2].as_bytes()).context("Failed to parse envelope")?;
            let value: serde_json::Value = envelope.value().context("Failed to decode value")?;
            println!("sender: {}", envelope.meta.id);
            println!("echo:   {}", envelope.meta.echo);
            println!("value:  {value}");
        }
        "help" | "--help" | "-h" => {
            print_help();
        }
        cmd => {
            eprintln!("Unknown command: {cmd}");
            print_help();
            std::process::exit(1);
        }
    }

    Ok(())
}

fn print_help() {
    println!(
        r#"MixedWorld Sync CLI

USAGE:
    mwsync <COMMAND> [OPTIONS]

COMMANDS:
    hash <text>                                   Print the 8-digit peer hash of a name
    topic <root> <object> <class> <property> [main]
                                                  Build a property topic
    match <filter> <topic>                        Test a topic against an MQTT filter
    envelope <peer-id> <json-value>               Wrap a JSON value for publishing
    unwrap <envelope-json>                        Decode a received envelope
    help                                          Show this help message

EXAMPLES:
    mwsync hash "3f2c8a3e-1b7d-4c55-9a1e-0d4b8e6c2f10"
    mwsync topic "" cube-7 SharedTransform pose
    mwsync match "Main/SharedProperty/+/#" "Main/SharedProperty/cube-7/SharedTransform/pose"
    mwsync envelope 377B546F '{{"on":true}}'
"#
    );
}
