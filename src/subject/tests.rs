use super::*;

fn projects() -> SubjectSet {
    SubjectSet::new("projects", "Project").unwrap()
}

// ============================================================================
// Subject construction
// ============================================================================

#[test]
fn test_command_subjects() {
    let set = projects();
    assert_eq!(set.create(), "cmd.projects.CreateProject");
    assert_eq!(set.update(), "cmd.projects.UpdateProject");
    assert_eq!(set.delete(), "cmd.projects.DeleteProject");
}

#[test]
fn test_event_subjects_mirror_commands() {
    let set = projects();
    assert_eq!(set.created(), "events.projects.ProjectCreated");
    assert_eq!(set.updated(), "events.projects.ProjectUpdated");
    assert_eq!(set.deleted(), "events.projects.ProjectDeleted");
}

#[test]
fn test_subjects_are_deterministic() {
    let a = SubjectSet::new("identity", "User").unwrap();
    let b = SubjectSet::new("identity", "User").unwrap();
    for verb in Verb::ALL {
        assert_eq!(a.command(verb), b.command(verb));
        assert_eq!(a.event(verb), b.event(verb));
    }
}

#[test]
fn test_dlq_subject_prefixes_original() {
    assert_eq!(
        dlq_subject("cmd.identity.UpdateUser"),
        "dlq.cmd.identity.UpdateUser"
    );
}

#[test]
fn test_durable_and_queue_names() {
    let set = SubjectSet::new("notifications", "Notification").unwrap();
    assert_eq!(
        set.durable_name(Verb::Create),
        "notifications-notification-create"
    );
    assert_eq!(
        set.queue_group(Verb::Delete),
        "notifications-notification-delete-workers"
    );
}

#[test]
fn test_rejects_invalid_tokens() {
    assert!(SubjectSet::new("", "Project").is_err());
    assert!(SubjectSet::new("projects", "Pro.ject").is_err());
    assert!(SubjectSet::new("proj ects", "Project").is_err());
    assert!(SubjectSet::new("projects", "*").is_err());
}

// ============================================================================
// Stream validation
// ============================================================================

#[test]
fn test_stream_of_subject() {
    assert_eq!(
        StreamKind::of_subject("cmd.projects.CreateProject"),
        Some(StreamKind::Cmd)
    );
    assert_eq!(
        StreamKind::of_subject("events.projects.ProjectCreated"),
        Some(StreamKind::Events)
    );
    assert_eq!(StreamKind::of_subject("other.x"), None);
}

#[test]
fn test_validate_subject_requires_stream_prefix() {
    assert!(StreamKind::Cmd
        .validate_subject("cmd.projects.CreateProject")
        .is_ok());
    assert!(matches!(
        StreamKind::Cmd.validate_subject("events.projects.ProjectCreated"),
        Err(SubjectError::WrongStream { stream: "cmd", .. })
    ));
    assert!(StreamKind::Cmd.validate_subject("cmdx.projects").is_err());
    assert!(StreamKind::Cmd.validate_subject("cmd").is_err());
    assert!(StreamKind::Cmd.validate_subject("cmd.").is_err());
    assert!(StreamKind::Cmd.validate_subject("cmd..x").is_err());
}

#[test]
fn test_stream_kind_from_str() {
    assert_eq!("dlq".parse::<StreamKind>().unwrap(), StreamKind::Dlq);
    assert!("DLQ".parse::<StreamKind>().is_err());
}

// ============================================================================
// Parsing
// ============================================================================

#[test]
fn test_parse_command_subject_inverts_construction() {
    let set = projects();
    for verb in Verb::ALL {
        let parsed = parse_command_subject(&set.command(verb)).unwrap();
        assert_eq!(parsed.service, "projects");
        assert_eq!(parsed.entity, "Project");
        assert_eq!(parsed.verb, verb);
        assert_eq!(parsed.subject_set().unwrap(), set);
    }
}

#[test]
fn test_parse_command_subject_rejects_unknown_shapes() {
    assert!(parse_command_subject("events.projects.ProjectCreated").is_err());
    assert!(matches!(
        parse_command_subject("cmd.projects.ArchiveProject"),
        Err(SubjectError::UnknownVerb(_))
    ));
    assert!(matches!(
        parse_command_subject("cmd.projects.Create"),
        Err(SubjectError::UnknownVerb(_))
    ));
    assert!(matches!(
        parse_command_subject("cmd.projects.CreateProject.extra"),
        Err(SubjectError::MalformedCommand(_))
    ));
}

// ============================================================================
// Wildcards
// ============================================================================

#[test]
fn test_subject_matches_exact() {
    assert!(subject_matches("cmd.a.B", "cmd.a.B"));
    assert!(!subject_matches("cmd.a.B", "cmd.a.C"));
    assert!(!subject_matches("cmd.a", "cmd.a.B"));
    assert!(!subject_matches("cmd.a.B", "cmd.a"));
}

#[test]
fn test_subject_matches_single_token_wildcard() {
    assert!(subject_matches("cmd.a.B", "cmd.*.B"));
    assert!(!subject_matches("cmd.a.x.B", "cmd.*.B"));
}

#[test]
fn test_subject_matches_tail_wildcard() {
    assert!(subject_matches("cmd.a.B", "cmd.>"));
    assert!(subject_matches("cmd.a", "cmd.>"));
    assert!(!subject_matches("cmd", "cmd.>"));
    assert!(!subject_matches("events.a", "cmd.>"));
}
