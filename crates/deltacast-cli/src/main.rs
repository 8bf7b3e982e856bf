//! # Deltacast CLI
//!
//! Command-line utilities for poking a running broker: inspect schemas
//! and instances, apply mutations, and watch pushes live.

use anyhow::{bail, Context, Result};
use deltacast_client::{Client, TopicEvent};
use std::env;

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_help();
        return Ok(());
    }

    match args[1].as_str() {
        "schema" => {
            if args.len() < 3 {
                eprintln!("Usage: deltacast schema <topic>");
                std::process::exit(1);
            }
            let client = connect().await?;
            let shape = client.schema(&args[2]).await?;
            println!("{}", serde_json::to_string_pretty(&shape)?);
        }
        "list" => {
            if args.len() < 3 {
                eprintln!("Usage: deltacast list <topic>");
                std::process::exit(1);
            }
            let client = connect().await?;
            let listed = client.list(&args[2]).await?;
            println!("{}", serde_json::to_string_pretty(&listed)?);
        }
        "instance" => {
            if args.len() < 3 {
                eprintln!("Usage: deltacast instance <topic>");
                std::process::exit(1);
            }
            let client = connect().await?;
            let id = client.create_instance(&args[2]).await?;
            println!("{id}");
        }
        "mutate" => {
            if args.len() < 5 {
                eprintln!("Usage: deltacast mutate <topic> <id> <change-json>");
                std::process::exit(1);
            }
            let change: serde_json::Value =
                serde_json::from_str(&args[4]).context("Invalid change JSON")?;
            let Some(change) = change.as_object().cloned() else {
                bail!("change must be a JSON object");
            };
            let client = connect().await?;
            client.mutate(&args[2], &args[3], change).await?;
            println!("ok");
        }
        "watch" => {
            if args.len() < 3 {
                eprintln!("Usage: deltacast watch <topic> [id]");
                std::process::exit(1);
            }
            let client = connect().await?;
            let topic = &args[2];
            match args.get(3) {
                Some(id) => client.subscribe_instance(topic, id, print_event).await?,
                None => client.subscribe(topic, print_event).await?,
            }
            eprintln!("Watching {topic}; Ctrl-C to stop");
            tokio::signal::ctrl_c().await?;
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

async fn connect() -> Result<Client> {
    let host = env::var("DELTACAST_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port = match env::var("DELTACAST_TCP_PORT") {
        Ok(port) => port.parse().context("Invalid DELTACAST_TCP_PORT")?,
        Err(_) => 4501,
    };
    Ok(Client::connect(&host, port).await?)
}

fn print_event(event: &TopicEvent) {
    match event {
        TopicEvent::Mutation { topic, id, change } => {
            let change = serde_json::to_string(change).unwrap_or_default();
            println!("{topic}/{id} {change}");
        }
        TopicEvent::NewInstance { topic, id } => {
            println!("{topic}/{id} created");
        }
    }
}

fn print_help() {
    println!(
        r#"Deltacast CLI

USAGE:
    deltacast <COMMAND> [OPTIONS]

COMMANDS:
    schema <topic>              Print the shape registered for a topic
    list <topic>                Print every instance of a topic
    instance <topic>            Mint a fresh instance and print its id
    mutate <topic> <id> <json>  Apply a field mutation
    watch <topic> [id]          Stream pushes for a topic or one instance
    help                        Show this help message

The broker address comes from DELTACAST_HOST (default 127.0.0.1) and
DELTACAST_TCP_PORT (default 4501).

EXAMPLES:
    deltacast instance players
    deltacast mutate players 7c9e6679-7425-40de-944b-e07fc1f90ae7 '{{"x": 3}}'
    deltacast watch players
"#
    );
}
