#![allow(clippy::unwrap_used)]

mod bits;

use std::sync::{atomic::AtomicBool, Arc};

use bits::testio::*;
use sieve_engine::{
    compile, execute, Binary, CollectingHandler, ExitCode, ExtensionRegistry, MessageContext,
    ScriptEnv,
};
use test_log::test;

fn run_script(
    registry: &ExtensionRegistry,
    script: &str,
    mail: &TestMail,
    store: &TestStore,
) -> ExitCode {
    let binary = compile_ok(registry, script);
    let data = msgdata(mail);
    let env = ScriptEnv {
        store: Some(store),
        ..ScriptEnv::default()
    };
    let mut msgctx = MessageContext::new();
    let mut handler = CollectingHandler::new();
    let code = execute(&binary, registry, &data, &env, &mut msgctx, &mut handler);
    assert!(
        handler.error_messages().is_empty(),
        "unexpected errors: {:?}",
        handler.diagnostics
    );
    code
}

// --- the literal scenarios ---

#[test]
fn fileinto_on_matching_subject() {
    let registry = ExtensionRegistry::bundled();
    let mail = TestMail::new().with_header("Subject", "Hi");
    let store = TestStore::default();
    let code = run_script(
        &registry,
        r#"require ["fileinto"]; if header :is "Subject" "Hi" { fileinto "INBOX.Greetings"; }"#,
        &mail,
        &store,
    );
    assert_eq!(code, ExitCode::Ok);
    // The fileinto suppressed the implicit keep.
    assert_eq!(
        *store.stored.borrow(),
        [("INBOX.Greetings".to_owned(), vec![])]
    );
}

#[test]
fn no_match_leaves_implicit_keep() {
    let registry = ExtensionRegistry::bundled();
    let mail = TestMail::new()
        .with_header("X-Spam", "NO")
        .with_size(50 * 1024);
    let store = TestStore::default();
    let code = run_script(
        &registry,
        r#"if anyof (header :contains "X-Spam" "YES", size :over 100K) { discard; stop; }"#,
        &mail,
        &store,
    );
    assert_eq!(code, ExitCode::KeepOnly);
    assert_eq!(*store.stored.borrow(), [("INBOX".to_owned(), vec![])]);
}

#[test]
fn address_localpart_redirects_once() {
    let registry = ExtensionRegistry::bundled();
    let mail = TestMail::new().with_header("From", "Root <ROOT@host>");
    let binary = compile_ok(
        &registry,
        r#"if address :localpart :is "from" "root" { redirect "admin@x.test"; }"#,
    );
    let data = msgdata(&mail);
    let smtp = TestSmtp::default();
    let store = TestStore::default();
    let env = ScriptEnv {
        store: Some(&store),
        smtp: Some(&smtp),
        ..ScriptEnv::default()
    };
    let mut handler = CollectingHandler::new();
    let code = execute(
        &binary,
        &registry,
        &data,
        &env,
        &mut MessageContext::new(),
        &mut handler,
    );
    assert_eq!(code, ExitCode::Ok);
    // One forwarded copy, no implicit keep.
    let sent = smtp.sent.borrow();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, "admin@x.test");
    assert!(store.stored.borrow().is_empty());
}

#[test]
fn vacation_replies_once_per_sender() {
    let registry = ExtensionRegistry::bundled();
    let script = r#"require ["vacation"];
        vacation :days 7 :subject "Away" :handle "h1" "I am away";"#;
    let binary = compile_ok(&registry, script);

    let mail = TestMail::new()
        .with_header("From", "sender@remote.test")
        .with_header("To", "me@example.net")
        .with_header("Subject", "ping");
    let smtp = TestSmtp::default();
    let duplicates = TestDuplicates::default();

    for delivery in 0..2 {
        let data = msgdata(&mail);
        let env = ScriptEnv {
            username: Some("me".into()),
            hostname: Some("example.net".into()),
            smtp: Some(&smtp),
            duplicates: Some(&duplicates),
            ..ScriptEnv::default()
        };
        let mut handler = CollectingHandler::new();
        let code = execute(
            &binary,
            &registry,
            &data,
            &env,
            &mut MessageContext::new(),
            &mut handler,
        );
        assert_eq!(code, ExitCode::Ok, "delivery {delivery}");
    }

    // First delivery replied and marked; the second was a duplicate.
    let sent = smtp.sent.borrow();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, "sender@remote.test");
    let payload = String::from_utf8_lossy(&sent[0].1);
    assert!(payload.contains("Subject: Away"));
    assert!(payload.contains("Auto-Submitted: auto-replied (vacation)"));
    assert!(payload.contains("I am away"));
    assert_eq!(duplicates.len(), 1);
}

#[test]
fn setflag_attaches_to_keep() {
    let registry = ExtensionRegistry::bundled();
    let mail = TestMail::new().with_header("Subject", "Re: hello");
    let store = TestStore::default();
    let code = run_script(
        &registry,
        r#"require ["imap4flags"];
           if header :matches "Subject" "Re: *" { setflag "\\Answered"; keep; }"#,
        &mail,
        &store,
    );
    assert_eq!(code, ExitCode::Ok);
    assert_eq!(
        *store.stored.borrow(),
        [("INBOX".to_owned(), vec!["\\Answered".to_owned()])]
    );
}

#[test]
fn unknown_extension_in_binary_refuses_to_run() {
    let registry = ExtensionRegistry::bundled();
    let mut binary = Binary::new();
    binary.link_extension("frobnicate").unwrap();
    // Code content is irrelevant; extension resolution fails first.
    binary.emit_u8(0x06);

    let mail = TestMail::new();
    let data = msgdata(&mail);
    let mut handler = CollectingHandler::new();
    let code = execute(
        &binary,
        &registry,
        &data,
        &ScriptEnv::default(),
        &mut MessageContext::new(),
        &mut handler,
    );
    assert_eq!(code, ExitCode::Failed);
    assert!(handler.error_messages()[0].contains("unknown extension `frobnicate`"));
}

// --- invariants ---

#[test]
fn compile_is_deterministic_and_reopens_byte_equal() {
    let registry = ExtensionRegistry::bundled();
    let script = r#"require ["fileinto", "imap4flags"];
        if anyof (exists "x-a", header :contains ["x-b", "x-c"] "v") {
            fileinto :flags "\\Seen" "Target";
        } else { keep; }"#;
    let a = compile_ok(&registry, script);
    let b = compile_ok(&registry, script);
    assert_eq!(a, b);
    assert_eq!(a.to_bytes(), b.to_bytes());

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("script.svbc");
    sieve_engine::save(&a, &path).unwrap();
    let reopened = sieve_engine::open(&path, &registry).unwrap();
    assert_eq!(reopened, a);
}

#[test]
fn open_rejects_unknown_extensions() {
    let registry = ExtensionRegistry::bundled();
    let mut binary = Binary::new();
    binary.link_extension("frobnicate").unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.svbc");
    sieve_engine::save(&binary, &path).unwrap();
    assert!(matches!(
        sieve_engine::open(&path, &registry),
        Err(sieve_engine::OpenError::UnknownExtension(name)) if name == "frobnicate"
    ));
}

#[test]
fn dump_is_deterministic() {
    let registry = ExtensionRegistry::bundled();
    let script = r#"require ["vacation", "duplicate"];
        if not duplicate :handle "h" { vacation :days 2 "away"; }"#;
    let mut first = Vec::new();
    let mut second = Vec::new();
    sieve_engine::dump(&compile_ok(&registry, script), &registry, &mut first).unwrap();
    sieve_engine::dump(&compile_ok(&registry, script), &registry, &mut second).unwrap();
    assert_eq!(first, second);
    let text = String::from_utf8(first).unwrap();
    assert!(text.contains("VACATION"));
    assert!(text.contains("DUPLICATE"));
    assert!(text.contains("; extension 0: vacation"));
}

#[test]
fn anyof_short_circuits() {
    let registry = ExtensionRegistry::bundled();
    let mail = TestMail::new().with_header("x-a", "1").with_header("x-b", "1");
    let store = TestStore::default();
    let code = run_script(
        &registry,
        r#"if anyof (exists "x-a", exists "x-b") { stop; }"#,
        &mail,
        &store,
    );
    assert_eq!(code, ExitCode::KeepOnly);
    let requested = mail.requested.borrow();
    assert!(requested.contains(&"x-a".to_owned()));
    assert!(
        !requested.contains(&"x-b".to_owned()),
        "anyof evaluated its second test after the first was true"
    );
}

#[test]
fn allof_short_circuits() {
    let registry = ExtensionRegistry::bundled();
    let mail = TestMail::new().with_header("x-b", "1");
    let store = TestStore::default();
    let code = run_script(
        &registry,
        r#"if allof (exists "x-a", exists "x-b") { stop; }"#,
        &mail,
        &store,
    );
    assert_eq!(code, ExitCode::KeepOnly);
    let requested = mail.requested.borrow();
    assert!(!requested.contains(&"x-b".to_owned()));
}

#[test]
fn elsif_chain_picks_the_right_branch() {
    let registry = ExtensionRegistry::bundled();
    let script = r#"require ["fileinto"];
        if header :is "x-class" "a" { fileinto "A"; }
        elsif header :is "x-class" "b" { fileinto "B"; }
        else { fileinto "C"; }"#;
    for (value, expected) in [("a", "A"), ("b", "B"), ("z", "C")] {
        let mail = TestMail::new().with_header("x-class", value);
        let store = TestStore::default();
        let code = run_script(&registry, script, &mail, &store);
        assert_eq!(code, ExitCode::Ok);
        assert_eq!(*store.stored.borrow(), [(expected.to_owned(), vec![])]);
    }
}

#[test]
fn stop_halts_the_script() {
    let registry = ExtensionRegistry::bundled();
    let mail = TestMail::new();
    let store = TestStore::default();
    let code = run_script(
        &registry,
        r#"require ["fileinto"]; fileinto "A"; stop; fileinto "B";"#,
        &mail,
        &store,
    );
    assert_eq!(code, ExitCode::Ok);
    assert_eq!(*store.stored.borrow(), [("A".to_owned(), vec![])]);
}

#[test]
fn duplicate_fileinto_coalesces() {
    let registry = ExtensionRegistry::bundled();
    let mail = TestMail::new();
    let store = TestStore::default();
    let code = run_script(
        &registry,
        r#"require ["fileinto"]; fileinto "A"; fileinto "A"; fileinto "B";"#,
        &mail,
        &store,
    );
    assert_eq!(code, ExitCode::Ok);
    assert_eq!(
        *store.stored.borrow(),
        [("A".to_owned(), vec![]), ("B".to_owned(), vec![])]
    );
}

#[test]
fn second_vacation_conflicts() {
    let registry = ExtensionRegistry::bundled();
    let binary = compile_ok(
        &registry,
        r#"require ["vacation"]; vacation "gone"; vacation :subject "s" "also gone";"#,
    );
    let mail = TestMail::new().with_header("To", "me@example.net");
    let data = msgdata(&mail);
    let mut handler = CollectingHandler::new();
    let code = execute(
        &binary,
        &registry,
        &data,
        &ScriptEnv::default(),
        &mut MessageContext::new(),
        &mut handler,
    );
    assert_eq!(code, ExitCode::Failed);
    assert!(handler.error_messages()[0].contains("duplicate vacation action"));
}

#[test]
fn duplicate_test_marks_only_on_commit() {
    let registry = ExtensionRegistry::bundled();
    let script = r#"require ["duplicate", "fileinto"];
        if duplicate { fileinto "Dups"; }"#;
    let binary = compile_ok(&registry, script);
    let duplicates = TestDuplicates::default();
    let store = TestStore::default();
    let mail = TestMail::new();

    let mut run = || {
        let data = msgdata(&mail);
        let env = ScriptEnv {
            store: Some(&store),
            duplicates: Some(&duplicates),
            ..ScriptEnv::default()
        };
        let mut handler = CollectingHandler::new();
        execute(
            &binary,
            &registry,
            &data,
            &env,
            &mut MessageContext::new(),
            &mut handler,
        )
    };

    // First delivery: not a duplicate, implicit keep, mark recorded.
    assert_eq!(run(), ExitCode::KeepOnly);
    assert_eq!(duplicates.len(), 1);
    // Second delivery of the same message id: filed as duplicate.
    assert_eq!(run(), ExitCode::Ok);
    assert_eq!(
        *store.stored.borrow(),
        [("INBOX".to_owned(), vec![]), ("Dups".to_owned(), vec![])]
    );
}

#[test]
fn duplicate_verdict_is_cached_per_message() {
    let registry = ExtensionRegistry::bundled();
    let script = r#"require ["duplicate", "fileinto"];
        if duplicate { fileinto "A"; }
        if duplicate { fileinto "B"; }"#;
    let binary = compile_ok(&registry, script);
    let duplicates = TestDuplicates::default();
    let store = TestStore::default();
    let mail = TestMail::new();
    let data = msgdata(&mail);
    let env = ScriptEnv {
        store: Some(&store),
        duplicates: Some(&duplicates),
        ..ScriptEnv::default()
    };
    let mut handler = CollectingHandler::new();
    // Both tests agree within one message even though the first one
    // plans the mark.
    let code = execute(
        &binary,
        &registry,
        &data,
        &env,
        &mut MessageContext::new(),
        &mut handler,
    );
    assert_eq!(code, ExitCode::KeepOnly);
    assert!(store.stored.borrow().iter().all(|(m, _)| m == "INBOX"));
}

#[test]
fn hasflag_sees_the_internal_flag_set() {
    let registry = ExtensionRegistry::bundled();
    let mail = TestMail::new();
    let store = TestStore::default();
    let code = run_script(
        &registry,
        r#"require ["imap4flags", "fileinto"];
           addflag ["\\Seen", "$Work"];
           removeflag "\\seen";
           if hasflag "$work" { fileinto "Flagged"; }
           if hasflag "\\Seen" { fileinto "Wrong"; }"#,
        &mail,
        &store,
    );
    assert_eq!(code, ExitCode::Ok);
    assert_eq!(
        *store.stored.borrow(),
        [("Flagged".to_owned(), vec!["$Work".to_owned()])]
    );
}

#[test]
fn implicit_keep_carries_flags() {
    let registry = ExtensionRegistry::bundled();
    let mail = TestMail::new();
    let store = TestStore::default();
    let code = run_script(
        &registry,
        r#"require ["imap4flags"]; setflag "\\Flagged";"#,
        &mail,
        &store,
    );
    assert_eq!(code, ExitCode::KeepOnly);
    assert_eq!(
        *store.stored.borrow(),
        [("INBOX".to_owned(), vec!["\\Flagged".to_owned()])]
    );
}

#[test]
fn explicit_flags_tag_overrides_flag_set() {
    let registry = ExtensionRegistry::bundled();
    let mail = TestMail::new();
    let store = TestStore::default();
    let code = run_script(
        &registry,
        r#"require ["imap4flags", "fileinto"];
           setflag "\\Seen";
           fileinto :flags "\\Draft" "Drafts";"#,
        &mail,
        &store,
    );
    assert_eq!(code, ExitCode::Ok);
    assert_eq!(
        *store.stored.borrow(),
        [("Drafts".to_owned(), vec!["\\Draft".to_owned()])]
    );
}

#[test]
fn envelope_matches_the_return_path() {
    let registry = ExtensionRegistry::bundled();
    let mail = TestMail::new();
    let store = TestStore::default();
    let code = run_script(
        &registry,
        r#"require ["envelope", "fileinto"];
           if envelope :domain :is "from" "remote.test" { fileinto "Remote"; }"#,
        &mail,
        &store,
    );
    assert_eq!(code, ExitCode::Ok);
    assert_eq!(*store.stored.borrow(), [("Remote".to_owned(), vec![])]);
}

#[test]
fn abort_flag_discards_the_result() {
    let registry = ExtensionRegistry::bundled();
    let binary = compile_ok(&registry, r#"require ["fileinto"]; fileinto "A";"#);
    let mail = TestMail::new();
    let data = msgdata(&mail);
    let store = TestStore::default();
    let abort = Arc::new(AtomicBool::new(true));
    let env = ScriptEnv {
        store: Some(&store),
        abort: Some(abort),
        ..ScriptEnv::default()
    };
    let mut handler = CollectingHandler::new();
    let code = execute(
        &binary,
        &registry,
        &data,
        &env,
        &mut MessageContext::new(),
        &mut handler,
    );
    assert_eq!(code, ExitCode::TempFailure);
    assert!(store.stored.borrow().is_empty());
}

#[test]
fn corrupt_binary_is_reported() {
    let registry = ExtensionRegistry::bundled();
    let mut binary = Binary::new();
    binary.emit_u8(0x7f);
    let mail = TestMail::new();
    let data = msgdata(&mail);
    let mut handler = CollectingHandler::new();
    let code = execute(
        &binary,
        &registry,
        &data,
        &ScriptEnv::default(),
        &mut MessageContext::new(),
        &mut handler,
    );
    assert_eq!(code, ExitCode::BinaryCorrupt);
    assert!(handler.error_messages()[0].contains("corrupt binary"));
}

#[test]
fn unknown_optional_operand_is_corrupt() {
    let registry = ExtensionRegistry::bundled();
    let mut binary = Binary::new();
    // KEEP, source line 1, then an optional-operand code nothing owns.
    binary.emit_u8(0x07);
    binary.emit_packed(1);
    binary.emit_opt_code(9);
    let mail = TestMail::new();
    let data = msgdata(&mail);
    let mut handler = CollectingHandler::new();
    let code = execute(
        &binary,
        &registry,
        &data,
        &ScriptEnv::default(),
        &mut MessageContext::new(),
        &mut handler,
    );
    assert_eq!(code, ExitCode::BinaryCorrupt);
}

#[test]
fn vacation_ignores_bulk_and_self_addressed_messages() {
    let registry = ExtensionRegistry::bundled();
    let binary = compile_ok(
        &registry,
        r#"require ["vacation"]; vacation "away";"#,
    );
    let smtp = TestSmtp::default();

    // Precedence: bulk suppresses the reply.
    let bulk = TestMail::new()
        .with_header("To", "me@example.net")
        .with_header("Precedence", "bulk");
    // A mailing-list header suppresses the reply.
    let list = TestMail::new()
        .with_header("To", "me@example.net")
        .with_header("List-Id", "<dev.example.net>");
    // A message not addressed to the user suppresses the reply.
    let not_mine = TestMail::new().with_header("To", "other@example.net");

    for mail in [&bulk, &list, &not_mine] {
        let data = msgdata(mail);
        let env = ScriptEnv {
            smtp: Some(&smtp),
            ..ScriptEnv::default()
        };
        let mut handler = CollectingHandler::new();
        let code = execute(
            &binary,
            &registry,
            &data,
            &env,
            &mut MessageContext::new(),
            &mut handler,
        );
        assert_eq!(code, ExitCode::Ok);
    }
    assert!(smtp.sent.borrow().is_empty());

    // A reply to the user's own address is suppressed too.
    let mail = TestMail::new().with_header("To", "me@example.net");
    let mut data = msgdata(&mail);
    data.return_path = Some("me@example.net".into());
    let env = ScriptEnv {
        smtp: Some(&smtp),
        ..ScriptEnv::default()
    };
    let mut handler = CollectingHandler::new();
    let code = execute(
        &binary,
        &registry,
        &data,
        &env,
        &mut MessageContext::new(),
        &mut handler,
    );
    assert_eq!(code, ExitCode::Ok);
    assert!(smtp.sent.borrow().is_empty());
}

#[test]
fn store_failure_is_temporary_when_the_store_says_so() {
    let registry = ExtensionRegistry::bundled();
    let binary = compile_ok(&registry, r#"require ["fileinto"]; fileinto "A";"#);
    let mail = TestMail::new();
    let data = msgdata(&mail);
    let store = FailingStore { temporary: true };
    let env = ScriptEnv {
        store: Some(&store),
        ..ScriptEnv::default()
    };
    let mut handler = CollectingHandler::new();
    let code = execute(
        &binary,
        &registry,
        &data,
        &env,
        &mut MessageContext::new(),
        &mut handler,
    );
    assert_eq!(code, ExitCode::TempFailure);
    assert!(!handler.error_messages().is_empty());
}

// --- validation diagnostics ---

#[test]
fn fileinto_requires_require() {
    let registry = ExtensionRegistry::bundled();
    let mut handler = CollectingHandler::new();
    let err = compile(r#"fileinto "X";"#, &registry, &mut handler).unwrap_err();
    assert!(matches!(err, sieve_engine::CompileError::Validation(1)));
    assert!(handler.error_messages()[0].contains("unknown command `fileinto`"));
}

#[test]
fn unknown_extension_fails_validation() {
    let registry = ExtensionRegistry::bundled();
    let mut handler = CollectingHandler::new();
    let err = compile(r#"require "frobnicate";"#, &registry, &mut handler).unwrap_err();
    assert!(matches!(err, sieve_engine::CompileError::Validation(_)));
    assert!(handler.error_messages()[0].contains("unknown extension `frobnicate`"));
}

#[test]
fn type_mismatch_is_reported_with_line() {
    let registry = ExtensionRegistry::bundled();
    let mut handler = CollectingHandler::new();
    let script = "require [\"fileinto\"];\nfileinto 42;";
    compile(script, &registry, &mut handler).unwrap_err();
    let diag = &handler.diagnostics[0];
    assert_eq!(diag.line, Some(2));
    assert!(diag.message.contains("expects a string"));
}

#[test]
fn misplaced_require_is_rejected() {
    let registry = ExtensionRegistry::bundled();
    let mut handler = CollectingHandler::new();
    compile(
        r#"keep; require "fileinto";"#,
        &registry,
        &mut handler,
    )
    .unwrap_err();
    assert!(handler.error_messages()[0].contains("must precede"));
}

#[test]
fn size_needs_over_or_under() {
    let registry = ExtensionRegistry::bundled();
    let mut handler = CollectingHandler::new();
    compile(r#"if size 100 { stop; }"#, &registry, &mut handler).unwrap_err();
    assert!(handler.error_messages()[0].contains(":over or the :under"));
}

#[test]
fn validation_is_deterministic() {
    let registry = ExtensionRegistry::bundled();
    let script = r#"keep :bogus; unknowncmd; if size 1 { stop; }"#;
    let collect = || {
        let mut handler = CollectingHandler::new();
        let _ = compile(script, &registry, &mut handler);
        handler.diagnostics
    };
    assert_eq!(collect(), collect());
}

#[test]
fn days_zero_clamps_with_a_warning() {
    let registry = ExtensionRegistry::bundled();
    let mut handler = CollectingHandler::new();
    let binary = compile(
        r#"require "vacation"; vacation :days 0 "away";"#,
        &registry,
        &mut handler,
    )
    .unwrap();
    assert!(handler.warning_messages()[0].contains(":days 0"));
    // The clamped value is what lands in the binary.
    let mut out = Vec::new();
    sieve_engine::dump(&binary, &registry, &mut out).unwrap();
    assert!(String::from_utf8(out).unwrap().contains("days: 1"));
}
