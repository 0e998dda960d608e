//! The `vacation` extension (RFC 5230): automatic replies with
//! per-sender deduplication.

use std::{any::Any, io::Write, sync::Arc};

use sha2::{Digest, Sha256};

use crate::{
    action::{Action, ActionDef, ActionExecEnv, DuplicatePolicy, SideEffect},
    address::{list_contains, parse_addresses},
    codegen::Generator,
    command::{
        ArgStream, CommandCtx, CommandDef, CommandKind, CommandRegistration, CommandSpec,
        TagActivation, TagDef, ValidatedCommand, ValueTag,
    },
    dump::{DumpError, Dumper},
    error::{ActionError, CodegenError, CommitStatus, ExecError},
    extension::Extension,
    interp::{Interpreter, Operation},
    runtime::unix_now,
    validate::{ArgType, Validator},
};

pub(crate) const EXT_NAME: &str = "vacation";

const OP_VACATION: u32 = 0;

const OPT_DAYS: u64 = 1;
const OPT_SUBJECT: u64 = 2;
const OPT_FROM: u64 = 3;
const OPT_ADDRESSES: u64 = 4;
const OPT_MIME: u64 = 5;

const DEFAULT_DAYS: u64 = 7;

/// Headers that mark a message as mailing-list traffic; such messages
/// never get a reply.
const LIST_HEADERS: [&str; 7] = [
    "list-id",
    "list-owner",
    "list-subscribe",
    "list-post",
    "list-unsubscribe",
    "list-help",
    "list-archive",
];

/// Headers searched for the user's own address before replying.
const MY_ADDRESS_HEADERS: [&str; 6] =
    ["to", "cc", "bcc", "resent-to", "resent-cc", "resent-bcc"];

/// The `vacation` extension object.
pub struct VacationExt;

impl Extension for VacationExt {
    fn name(&self) -> &'static str {
        EXT_NAME
    }

    fn validator_load(&self, valdtr: &mut Validator<'_>) {
        valdtr.register_command(Arc::new(VacationCmd));
    }

    fn operation(&self, code: u32) -> Option<&dyn Operation> {
        match code {
            OP_VACATION => Some(&VacationOp),
            _ => None,
        }
    }
}

/// Command data collected by the tag validators, used to synthesize
/// the deduplication handle.
#[derive(Debug, Default)]
struct VacationData {
    handle: Option<String>,
    subject: Option<String>,
    from: Option<String>,
    mime: bool,
}

struct VacationCmd;

impl CommandDef for VacationCmd {
    fn spec(&self) -> &CommandSpec {
        static SPEC: CommandSpec = CommandSpec {
            name: "vacation",
            kind: CommandKind::Command,
            positional: 1,
            subtests: 0,
            block_allowed: false,
            block_required: false,
        };
        &SPEC
    }

    fn registered(&self, _valdtr: &mut Validator<'_>, reg: &mut CommandRegistration) {
        reg.register_tag(Arc::new(DaysTag), OPT_DAYS);
        reg.register_tag(Arc::new(SubjectTag), OPT_SUBJECT);
        reg.register_tag(Arc::new(FromTag), OPT_FROM);
        reg.register_tag(
            Arc::new(ValueTag {
                name: "addresses",
                ty: ArgType::StringList,
            }),
            OPT_ADDRESSES,
        );
        reg.register_tag(Arc::new(MimeTag), OPT_MIME);
        reg.register_tag(Arc::new(HandleTag), 0);
    }

    fn pre_validate(&self, _valdtr: &mut Validator<'_>, cmd: &mut CommandCtx) -> bool {
        cmd.set_data(VacationData::default());
        true
    }

    fn validate(&self, valdtr: &mut Validator<'_>, cmd: &mut CommandCtx) -> bool {
        if !valdtr.validate_positional_argument(cmd, 0, "reason", ArgType::String) {
            return false;
        }
        cmd.activate(0);

        // Without an explicit :handle the reply parameters become the
        // handle, so changing the reply restarts the dedup window.
        let reason = cmd.string_arg(0).unwrap_or_default().to_owned();
        if let Some(data) = cmd.data_mut::<VacationData>() {
            if data.handle.is_none() {
                let mut handle = reason;
                handle.push_str(data.subject.as_deref().unwrap_or("<default-subject>"));
                handle.push_str(data.from.as_deref().unwrap_or("<default-from>"));
                handle.push_str(if data.mime { "<MIME>" } else { "<NO-MIME>" });
                data.handle = Some(handle);
            }
        }
        true
    }

    fn generate(
        &self,
        gen: &mut Generator<'_>,
        cmd: &ValidatedCommand,
    ) -> Result<(), CodegenError> {
        use buggy::bug;
        gen.emit_ext_op(EXT_NAME, OP_VACATION)?;
        gen.binary().emit_packed(u64::from(cmd.ctx.line));
        gen.generate_arguments(cmd)?;
        let Some(handle) = cmd.ctx.data::<VacationData>().and_then(|d| d.handle.clone()) else {
            bug!("vacation command without a handle");
        };
        gen.binary().emit_string_operand(&handle);
        Ok(())
    }
}

// --- tags ---

struct DaysTag;

impl TagDef for DaysTag {
    fn name(&self) -> &'static str {
        "days"
    }

    fn validate(
        &self,
        valdtr: &mut Validator<'_>,
        cmd: &mut CommandCtx,
        act: &mut TagActivation,
        args: &mut ArgStream,
    ) -> bool {
        let Some(sieve_ast::ArgValue::Number(days)) =
            valdtr.validate_tag_parameter(cmd, act, args, ArgType::Number)
        else {
            return false;
        };
        let days = if days == 0 {
            // RFC 5230 would allow 0 ("reply to every message"); this
            // implementation keeps the minimum of one day.
            valdtr.report_warning(
                act.line,
                format_args!(":days 0 is not supported, using :days 1"),
            );
            1
        } else {
            days
        };
        act.payload = Some(sieve_ast::ArgValue::Number(days));
        true
    }

    fn generate(
        &self,
        gen: &mut Generator<'_>,
        _cmd: &ValidatedCommand,
        act: &TagActivation,
    ) -> Result<(), CodegenError> {
        use buggy::bug;
        let Some(sieve_ast::ArgValue::Number(days)) = act.payload else {
            bug!(":days tag without validated payload");
        };
        gen.binary().emit_number_operand(days);
        Ok(())
    }
}

struct SubjectTag;

impl TagDef for SubjectTag {
    fn name(&self) -> &'static str {
        "subject"
    }

    fn validate(
        &self,
        valdtr: &mut Validator<'_>,
        cmd: &mut CommandCtx,
        act: &mut TagActivation,
        args: &mut ArgStream,
    ) -> bool {
        let Some(sieve_ast::ArgValue::String(subject)) =
            valdtr.validate_tag_parameter(cmd, act, args, ArgType::String)
        else {
            return false;
        };
        if let Some(data) = cmd.data_mut::<VacationData>() {
            data.subject = Some(subject.clone());
        }
        act.payload = Some(sieve_ast::ArgValue::String(subject));
        true
    }

    fn generate(
        &self,
        gen: &mut Generator<'_>,
        _cmd: &ValidatedCommand,
        act: &TagActivation,
    ) -> Result<(), CodegenError> {
        emit_string_payload(gen, act, ":subject")
    }
}

struct FromTag;

impl TagDef for FromTag {
    fn name(&self) -> &'static str {
        "from"
    }

    fn validate(
        &self,
        valdtr: &mut Validator<'_>,
        cmd: &mut CommandCtx,
        act: &mut TagActivation,
        args: &mut ArgStream,
    ) -> bool {
        let Some(sieve_ast::ArgValue::String(from)) =
            valdtr.validate_tag_parameter(cmd, act, args, ArgType::String)
        else {
            return false;
        };
        if parse_addresses(&from).is_empty() {
            valdtr.report_error(
                act.line,
                format_args!(
                    "specified :from address `{from}` is invalid for the vacation action"
                ),
            );
            return false;
        }
        if let Some(data) = cmd.data_mut::<VacationData>() {
            data.from = Some(from.clone());
        }
        act.payload = Some(sieve_ast::ArgValue::String(from));
        true
    }

    fn generate(
        &self,
        gen: &mut Generator<'_>,
        _cmd: &ValidatedCommand,
        act: &TagActivation,
    ) -> Result<(), CodegenError> {
        emit_string_payload(gen, act, ":from")
    }
}

struct MimeTag;

impl TagDef for MimeTag {
    fn name(&self) -> &'static str {
        "mime"
    }

    fn validate(
        &self,
        _valdtr: &mut Validator<'_>,
        cmd: &mut CommandCtx,
        _act: &mut TagActivation,
        _args: &mut ArgStream,
    ) -> bool {
        if let Some(data) = cmd.data_mut::<VacationData>() {
            data.mime = true;
        }
        true
    }
}

struct HandleTag;

impl TagDef for HandleTag {
    fn name(&self) -> &'static str {
        "handle"
    }

    fn validate(
        &self,
        valdtr: &mut Validator<'_>,
        cmd: &mut CommandCtx,
        act: &mut TagActivation,
        args: &mut ArgStream,
    ) -> bool {
        let Some(sieve_ast::ArgValue::String(handle)) =
            valdtr.validate_tag_parameter(cmd, act, args, ArgType::String)
        else {
            return false;
        };
        if let Some(data) = cmd.data_mut::<VacationData>() {
            data.handle = Some(handle);
        }
        true
    }
}

fn emit_string_payload(
    gen: &mut Generator<'_>,
    act: &TagActivation,
    what: &'static str,
) -> Result<(), CodegenError> {
    use buggy::bug;
    let Some(sieve_ast::ArgValue::String(s)) = &act.payload else {
        bug!("{what} tag without validated payload");
    };
    gen.binary().emit_string_operand(s);
    Ok(())
}

// --- the operation ---

struct VacationOp;

impl Operation for VacationOp {
    fn name(&self) -> &'static str {
        "VACATION"
    }

    fn execute(&self, it: &mut Interpreter<'_>) -> Result<(), ExecError> {
        let pc = it.reader().position();
        let line = it.read_source_line()?;

        let mut days = DEFAULT_DAYS;
        let mut subject = None;
        let mut from = None;
        let mut addresses = Vec::new();
        let mut mime = false;
        while let Some(code) = it.reader().read_opt_code()? {
            match code {
                OPT_DAYS => {
                    days = it.reader().read_number_operand()?.max(1);
                }
                OPT_SUBJECT => subject = Some(it.reader().read_string_operand()?),
                OPT_FROM => from = Some(it.reader().read_string_operand()?),
                OPT_ADDRESSES => addresses = it.reader().read_string_list_operand()?,
                OPT_MIME => mime = true,
                _ => return Err(it.corrupt(pc, "unknown optional operand")),
            }
        }
        let reason = it.reader().read_string_operand()?;
        let handle = it.reader().read_string_operand()?;

        if let Some(f) = &from {
            if parse_addresses(f).is_empty() {
                it.runtime_warning(
                    Some(line),
                    format_args!("specified :from address `{f}` is invalid, ignoring it"),
                );
                from = None;
            }
        }

        it.add_action(
            Box::new(VacationAction {
                reason,
                handle,
                days,
                mime,
                subject,
                from,
                addresses,
                hash: None,
                sent: false,
            }),
            Vec::new(),
            line,
        )
    }

    fn dump(&self, d: &mut Dumper<'_, '_>) -> Result<(), DumpError> {
        d.dump_source_line()?;
        while let Some(code) = d.reader().read_opt_code()? {
            match code {
                OPT_DAYS => d.dump_number("days")?,
                OPT_SUBJECT => d.dump_string("subject")?,
                OPT_FROM => d.dump_string("from")?,
                OPT_ADDRESSES => d.dump_string_list("addresses")?,
                OPT_MIME => d.write_line(format_args!("mime"))?,
                _ => return Err(d.unknown_operand()),
            }
        }
        d.dump_string("reason")?;
        d.dump_string("handle")
    }
}

// --- the action ---

static VACATION_DEF: ActionDef = ActionDef {
    name: "vacation",
    sends_response: true,
    cancels_keep: true,
    internal: false,
    duplicates: DuplicatePolicy::Error,
};

struct VacationAction {
    reason: String,
    handle: String,
    days: u64,
    mime: bool,
    subject: Option<String>,
    from: Option<String>,
    addresses: Vec<String>,
    /// Dedup hash, computed at commit.
    hash: Option<[u8; 32]>,
    sent: bool,
}

impl VacationAction {
    fn dedup_hash(&self, return_path: &str) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(return_path.as_bytes());
        hasher.update(self.handle.as_bytes());
        hasher.finalize().into()
    }

    fn addressed_to_me(&self, aenv: &ActionExecEnv<'_>) -> bool {
        let to_address = aenv.msgdata.to_address.as_deref();
        for header in MY_ADDRESS_HEADERS {
            let Ok(values) = aenv.msgdata.mail.get_headers_utf8(header) else {
                continue;
            };
            for value in &values {
                if let Some(me) = to_address {
                    if list_contains(value, me) {
                        return true;
                    }
                }
                if self.addresses.iter().any(|a| list_contains(value, a)) {
                    return true;
                }
            }
        }
        false
    }

    fn send_reply(
        &mut self,
        aenv: &mut ActionExecEnv<'_>,
        return_path: &str,
    ) -> Result<bool, ActionError> {
        let Some(smtp) = aenv.env.smtp else {
            aenv.ehandler
                .warning(None, format_args!("vacation action has no means to send mail"));
            return Ok(false);
        };

        let temp = |e: crate::runtime::SmtpError| ActionError::temporary(format!("vacation: {e}"));
        let io_err = |e: std::io::Error| ActionError::temporary(format!("vacation: {e}"));

        let mut out = smtp.open(return_path, None).map_err(temp)?;
        let hostname = aenv.env.hostname.as_deref().unwrap_or("localhost");

        write_header(&mut out, "X-Sieve", concat!("sieve-engine ", env!("CARGO_PKG_VERSION")))
            .map_err(io_err)?;
        write_header(
            &mut out,
            "Message-ID",
            &format!("<{}.sieve@{}>", unix_now(), hostname),
        )
        .map_err(io_err)?;
        write_header(&mut out, "Date", &chrono::Utc::now().to_rfc2822()).map_err(io_err)?;

        match (&self.from, &aenv.msgdata.to_address) {
            (Some(from), _) if !from.is_empty() => write_header(&mut out, "From", from),
            (_, Some(me)) => write_header(&mut out, "From", &format!("<{me}>")),
            _ => write_header(
                &mut out,
                "From",
                &format!("<{}>", aenv.env.postmaster_address.as_deref().unwrap_or("")),
            ),
        }
        .map_err(io_err)?;

        write_header(&mut out, "To", &format!("<{return_path}>")).map_err(io_err)?;
        write_header(
            &mut out,
            "Subject",
            self.subject.as_deref().unwrap_or("Automated reply"),
        )
        .map_err(io_err)?;

        // In-Reply-To and References tie the reply to the original.
        let references = aenv
            .msgdata
            .mail
            .get_headers("references")
            .ok()
            .and_then(|v| v.into_iter().next());
        if let Some(id) = &aenv.msgdata.id {
            write_header(&mut out, "In-Reply-To", id).map_err(io_err)?;
            let refs = match &references {
                Some(existing) => format!("{existing} {id}"),
                None => id.clone(),
            };
            write_header(&mut out, "References", &refs).map_err(io_err)?;
        } else if let Some(existing) = &references {
            write_header(&mut out, "References", existing).map_err(io_err)?;
        }

        write_header(&mut out, "Auto-Submitted", "auto-replied (vacation)").map_err(io_err)?;
        write_header(&mut out, "Precedence", "bulk").map_err(io_err)?;
        write_header(&mut out, "MIME-Version", "1.0").map_err(io_err)?;
        if !self.mime {
            write_header(&mut out, "Content-Type", "text/plain; charset=utf-8")
                .map_err(io_err)?;
            write_header(&mut out, "Content-Transfer-Encoding", "8bit").map_err(io_err)?;
            out.write_all(b"\r\n").map_err(io_err)?;
        }
        out.write_all(self.reason.as_bytes()).map_err(io_err)?;
        out.write_all(b"\r\n").map_err(io_err)?;

        if let Err(e) = out.close() {
            aenv.ehandler.error(
                None,
                format_args!("failed to send vacation response to <{return_path}>: {e}"),
            );
            return Ok(false);
        }
        Ok(true)
    }
}

impl Action for VacationAction {
    fn def(&self) -> &'static ActionDef {
        &VACATION_DEF
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn describe(&self) -> String {
        format!(
            "send vacation message (days: {}, subject: {})",
            self.days,
            self.subject.as_deref().unwrap_or("<default>")
        )
    }

    fn execute(
        &mut self,
        aenv: &mut ActionExecEnv<'_>,
        _side_effects: &[Box<dyn SideEffect>],
    ) -> Result<(), ActionError> {
        let Some(return_path) = aenv.msgdata.return_path.clone().filter(|r| !r.is_empty())
        else {
            tracing::info!("discarded vacation reply to <>");
            return Ok(());
        };

        if aenv.msgdata.to_address.as_deref() == Some(return_path.as_str()) {
            tracing::info!("discarded vacation reply to own address");
            return Ok(());
        }

        let hash = self.dedup_hash(&return_path);
        self.hash = Some(hash);
        if let Some(dups) = aenv.env.duplicates {
            if dups.check(&hash, aenv.env.username()) {
                tracing::info!(
                    %return_path,
                    "discarded duplicate vacation response"
                );
                return Ok(());
            }
        }

        for header in LIST_HEADERS {
            if matches!(aenv.msgdata.mail.get_first_header(header), Ok(Some(_))) {
                tracing::info!(
                    %return_path,
                    "discarding vacation response to mailing list recipient"
                );
                return Ok(());
            }
        }

        if let Ok(values) = aenv.msgdata.mail.get_headers("auto-submitted") {
            if values.iter().any(|v| !v.trim().eq_ignore_ascii_case("no")) {
                tracing::info!(
                    %return_path,
                    "discarding vacation response to auto-submitted message"
                );
                return Ok(());
            }
        }

        if let Ok(values) = aenv.msgdata.mail.get_headers("precedence") {
            if values.iter().any(|v| {
                matches!(v.trim().to_ascii_lowercase().as_str(), "junk" | "bulk" | "list")
            }) {
                tracing::info!(
                    %return_path,
                    "discarding vacation response to bulk precedence message"
                );
                return Ok(());
            }
        }

        if is_system_address(&return_path) {
            tracing::info!(%return_path, "not sending vacation response to system address");
            return Ok(());
        }

        if !self.addressed_to_me(aenv) {
            tracing::info!(
                to = aenv.msgdata.to_address.as_deref().unwrap_or("UNKNOWN"),
                "discarding vacation response for message implicitly delivered"
            );
            return Ok(());
        }

        if self.subject.as_deref().map_or(true, str::is_empty) {
            self.subject = match aenv.msgdata.mail.get_headers_utf8("subject") {
                Ok(values) if !values.is_empty() => Some(format!("Auto: {}", values[0])),
                _ => Some("Automated reply".to_owned()),
            };
        }

        if self.send_reply(aenv, &return_path)? {
            tracing::info!(%return_path, "sent vacation response");
            self.sent = true;
        }
        Ok(())
    }

    fn finish(&mut self, aenv: &mut ActionExecEnv<'_>, status: CommitStatus) {
        // The reply is only remembered when the whole run committed;
        // a requeued message may legitimately reply later.
        if status != CommitStatus::Ok || !self.sent {
            return;
        }
        if let (Some(hash), Some(dups)) = (&self.hash, aenv.env.duplicates) {
            let expires = unix_now().saturating_add(self.days.saturating_mul(24 * 60 * 60));
            dups.mark(hash, aenv.env.username(), expires);
        }
    }
}

fn is_system_address(address: &str) -> bool {
    let lower = address.to_ascii_lowercase();
    lower.starts_with("mailer-daemon")
        || lower.starts_with("listserv")
        || lower.starts_with("majordomo")
        || lower.contains("-request@")
        || lower.starts_with("owner-")
}

fn write_header(out: &mut dyn Write, name: &str, value: &str) -> std::io::Result<()> {
    write!(out, "{name}: {value}\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_addresses() {
        assert!(is_system_address("MAILER-DAEMON"));
        assert!(is_system_address("owner-list@example.com"));
        assert!(is_system_address("foo-request@example.com"));
        assert!(!is_system_address("alice@example.com"));
    }

    #[test]
    fn dedup_hash_covers_handle() {
        let mk = |handle: &str| VacationAction {
            reason: "away".into(),
            handle: handle.into(),
            days: 7,
            mime: false,
            subject: None,
            from: None,
            addresses: Vec::new(),
            hash: None,
            sent: false,
        };
        let a = mk("h1").dedup_hash("x@y.test");
        let b = mk("h2").dedup_hash("x@y.test");
        let c = mk("h1").dedup_hash("x@y.test");
        assert_ne!(a, b);
        assert_eq!(a, c);
    }
}
