// ABOUTME: Tests for the DISPATCH command grammar parser.
// ABOUTME: Covers every command, the case-insensitive marker, and Unknown fallbacks.

use crossbar::orchestrator::DispatchCommand;

#[test]
fn parse_create() {
    assert_eq!(
        DispatchCommand::parse("!create research"),
        DispatchCommand::Create {
            name: "research".to_string(),
            workspace: None
        }
    );
}

#[test]
fn parse_create_with_workspace() {
    assert_eq!(
        DispatchCommand::parse("!create research /home/morgan/ws/research"),
        DispatchCommand::Create {
            name: "research".to_string(),
            workspace: Some("/home/morgan/ws/research".to_string()),
        }
    );
}

#[test]
fn parse_create_without_name_is_unknown() {
    assert_eq!(
        DispatchCommand::parse("!create"),
        DispatchCommand::Unknown("!create".to_string())
    );
}

#[test]
fn parse_delete() {
    assert_eq!(
        DispatchCommand::parse("!delete research"),
        DispatchCommand::Delete {
            name: "research".to_string()
        }
    );
}

#[test]
fn parse_list_and_help_and_leave() {
    assert_eq!(DispatchCommand::parse("!list"), DispatchCommand::List);
    assert_eq!(DispatchCommand::parse("!help"), DispatchCommand::Help);
    assert_eq!(DispatchCommand::parse("!leave"), DispatchCommand::Leave);
}

#[test]
fn parse_status_and_join() {
    assert_eq!(
        DispatchCommand::parse("!status research"),
        DispatchCommand::Status {
            name: "research".to_string()
        }
    );
    assert_eq!(
        DispatchCommand::parse("!join research"),
        DispatchCommand::Join {
            name: "research".to_string()
        }
    );
}

#[test]
fn parse_tell_keeps_full_message() {
    assert_eq!(
        DispatchCommand::parse("!tell research summarize the latest paper"),
        DispatchCommand::Tell {
            session: "research".to_string(),
            message: "summarize the latest paper".to_string(),
        }
    );
}

#[test]
fn parse_tell_without_message_is_unknown() {
    assert_eq!(
        DispatchCommand::parse("!tell research"),
        DispatchCommand::Unknown("!tell research".to_string())
    );
}

#[test]
fn parse_read_with_and_without_count() {
    assert_eq!(
        DispatchCommand::parse("!read research 5"),
        DispatchCommand::Read {
            session: "research".to_string(),
            count: Some(5)
        }
    );
    assert_eq!(
        DispatchCommand::parse("!read research"),
        DispatchCommand::Read {
            session: "research".to_string(),
            count: None
        }
    );
    assert_eq!(
        DispatchCommand::parse("!read research lots"),
        DispatchCommand::Read {
            session: "research".to_string(),
            count: None
        }
    );
}

#[test]
fn parse_broadcast_keeps_full_message() {
    assert_eq!(
        DispatchCommand::parse("!broadcast wrap up for the day"),
        DispatchCommand::Broadcast {
            message: "wrap up for the day".to_string()
        }
    );
    assert_eq!(
        DispatchCommand::parse("!broadcast"),
        DispatchCommand::Unknown("!broadcast".to_string())
    );
}

#[test]
fn command_word_is_case_insensitive() {
    assert_eq!(DispatchCommand::parse("!HELP"), DispatchCommand::Help);
    assert_eq!(
        DispatchCommand::parse("!Join research"),
        DispatchCommand::Join {
            name: "research".to_string()
        }
    );
}

#[test]
fn unmarked_text_is_unknown() {
    assert_eq!(
        DispatchCommand::parse("hello there"),
        DispatchCommand::Unknown("hello there".to_string())
    );
}

#[test]
fn unknown_marker_command_is_unknown() {
    assert_eq!(
        DispatchCommand::parse("!frobnicate now"),
        DispatchCommand::Unknown("!frobnicate now".to_string())
    );
}

#[test]
fn surrounding_whitespace_is_ignored() {
    assert_eq!(DispatchCommand::parse("  !list  "), DispatchCommand::List);
}
