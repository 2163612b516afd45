use clap::Parser;
use flowstate::cli::{Cli, Commands};

#[test]
fn parses_list_filters() {
    let cli = Cli::try_parse_from([
        "flowstate", "list", "--user", "u1", "--status", "failed", "--offset", "10", "--limit",
        "5", "--format", "json",
    ])
    .unwrap();

    match cli.command {
        Commands::List {
            user,
            status,
            offset,
            limit,
            format,
            ..
        } => {
            assert_eq!(user.as_deref(), Some("u1"));
            assert_eq!(status.as_deref(), Some("failed"));
            assert_eq!(offset, Some(10));
            assert_eq!(limit, Some(5));
            assert_eq!(format, "json");
        }
        _ => panic!("expected list command"),
    }
}

#[test]
fn parses_truncate_and_snapshot() {
    let cli = Cli::try_parse_from(["flowstate", "truncate", "ord-1", "--from", "3"]).unwrap();
    assert!(matches!(
        cli.command,
        Commands::Truncate { ref flow_id, from: 3 } if flow_id == "ord-1"
    ));

    let cli = Cli::try_parse_from(["flowstate", "snapshot", "ord-1", "--step", "2"]).unwrap();
    assert!(matches!(cli.command, Commands::Snapshot { step: Some(2), .. }));
}

#[test]
fn async_flag_routes_ingest_through_queue() {
    let cli = Cli::try_parse_from([
        "flowstate",
        "--database-url",
        "sqlite://state.db",
        "ingest",
        "steps.json",
        "--async",
    ])
    .unwrap();
    assert!(matches!(cli.command, Commands::Ingest { queued: true, .. }));
}

#[test]
fn truncate_requires_from() {
    assert!(Cli::try_parse_from(["flowstate", "truncate", "ord-1"]).is_err());
}
