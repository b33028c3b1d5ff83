use aho_corasick::AhoCorasick;
use once_cell::sync::Lazy;
use regex::Regex;

/// Calls that hand their argument to a shell or replace the process image.
const EXEC_CALL: &str = r"(?:\bsystem|\bpopen|\bexecl[pe]?|\bexecv[pe]?|\bos\.system|\bos\.popen|\bos\.execute|\bio\.popen|\bshell_exec|\bpassthru|\bproc_open|\bdoSystemCmd|\btwsystem|\bRuntime\.getRuntime\(\)\.exec|\bsubprocess\.(?:call|run|Popen|check_output|check_call))";

/// Sources an attacker controls in CGI handlers and web admin daemons.
const USER_INPUT: &str = r"(?:\$_(?:GET|POST|REQUEST|COOKIE|SERVER)\b|\bgetenv\s*\(|\bargv\s*\[|\brequest\.(?:args|form|values|GET|POST)\b|\bparams\s*\[|\$ENV\{|\bQUERY_STRING\b|\bwebsGetVar\s*\(|\bnvram_(?:safe_)?get\s*\(|\bcgi_get\w*\s*\(|\bgetParameter\s*\(|\bhttpGetEnv\s*\(|\bfind_val\s*\()";

/// Any line without one of these cannot match a text rule.
const KEYWORDS: &[&str] = &[
    "system",
    "popen",
    "exec",
    "eval",
    "printf",
    "passthru",
    "proc_open",
    "subprocess",
    "-c",
    "QUERY_STRING",
    "FORM_",
    "HTTP_",
    "REQUEST_URI",
    "POST_",
    "GET_",
];

/// Dynamic symbols whose presence makes an embedded command template reachable.
pub(crate) const EXEC_IMPORTS: &[&str] = &[
    "system",
    "popen",
    "execl",
    "execlp",
    "execle",
    "execv",
    "execvp",
    "execve",
    "doSystemCmd",
    "twsystem",
];

pub(crate) struct TextRule {
    pub name: &'static str,
    pub rationale: &'static str,
    pub pattern: Regex,
}

fn rule(name: &'static str, rationale: &'static str, pattern: &str) -> TextRule {
    TextRule {
        name,
        rationale,
        pattern: Regex::new(pattern).expect("injection rule pattern"),
    }
}

pub(crate) static TEXT_RULES: Lazy<Vec<TextRule>> = Lazy::new(|| {
    vec![
        rule(
            "exec-string-concat",
            "command passed to a shell is built by concatenating a string with a variable",
            &format!(
                r#"{EXEC_CALL}\s*\(\s*[^;]*?(?:["']\s*(?:\+|\.\.?)\s*\$?[A-Za-z_]|[A-Za-z_\])]\s*(?:\+|\.\.)\s*["'$A-Za-z_])"#
            ),
        ),
        rule(
            "exec-interpolated-string",
            "command passed to a shell interpolates a variable into a string literal",
            &format!(
                r#"{EXEC_CALL}\s*\(\s*(?:f["'][^"']*\{{[A-Za-z_]|["'][^"']*(?:\$\{{?[A-Za-z_]|#\{{))"#
            ),
        ),
        rule(
            "exec-user-input",
            "request or environment input reaches a command execution call",
            &format!(r#"{EXEC_CALL}\s*\([^;]*{USER_INPUT}"#),
        ),
        rule(
            "shell-c-interpolation",
            "variable expanded inside a `sh -c` command string",
            r#"\b(?:sh|bash|ash|dash|busybox\s+sh)\s+-c\s+["'][^"']*\$\{?[A-Za-z_0-9@*]"#,
        ),
        rule(
            "eval-variable",
            "eval executes text that comes from a variable",
            r#"(?:^|[;&|({]\s*|\s)eval(?:\s*\(\s*\$?[A-Za-z_]|\s+["']?[^"'#]*\$[{(]?[A-Za-z_0-9@*])"#,
        ),
        rule(
            "cgi-input-substitution",
            "CGI request data is used inside a command substitution",
            r#"(?:\$\(|`)[^)`]*\$\{?(?:QUERY_STRING|REQUEST_URI|FORM_\w+|HTTP_\w+|POST_\w+|GET_\w+)"#,
        ),
    ]
});

/// `sprintf(buf, "... %s ...", ...)`: captures the destination buffer.
pub(crate) static FORMAT_INTO: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"\bs(?:n)?printf\s*\(\s*([A-Za-z_]\w*)\s*,\s*(?:[^,"]+,\s*)?"[^"]*%s"#)
        .expect("format pattern")
});

/// An exec-style call whose sole argument is a bare identifier.
pub(crate) static EXEC_OF_VARIABLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(r"{EXEC_CALL}\s*\(\s*([A-Za-z_]\w*)\s*[,)]")).expect("exec pattern")
});

pub(crate) static PREFILTER: Lazy<AhoCorasick> = Lazy::new(|| {
    AhoCorasick::builder()
        .ascii_case_insensitive(true)
        .build(KEYWORDS)
        .expect("keyword automaton")
});

/// Printable strings following a NUL that start with a shell command and carry `%s`.
static COMMAND_TEMPLATE: Lazy<regex::bytes::Regex> = Lazy::new(|| {
    regex::bytes::Regex::new(
        r"(?-u)\x00((?:/(?:usr/)?s?bin/)?(?:sh -c|ping|ping6|traceroute|iptables|ifconfig|route|echo|rm|cp|mv|kill|killall|nvram|wget|curl|tftp|insmod|rmmod|brctl|udhcpc|mount|chmod|telnetd|cat|sed|grep|ln|mkdir|touch|reboot|arp|iwpriv|iwconfig|nslookup) [\x20-\x7e]*%s[\x20-\x7e]*)",
    )
    .expect("command template pattern")
});

/// Byte offset and text of each shell command template embedded in `contents`.
pub fn command_templates(contents: &[u8]) -> Vec<(u64, String)> {
    COMMAND_TEMPLATE
        .captures_iter(contents)
        .filter_map(|caps| caps.get(1))
        .map(|m| {
            (
                m.start() as u64,
                String::from_utf8_lossy(m.as_bytes()).into_owned(),
            )
        })
        .collect()
}

/// Comment lines in shell, C-family, Lua and SQL sources.
pub(crate) fn is_comment(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with('#')
        || trimmed.starts_with("//")
        || trimmed.starts_with("/*")
        || trimmed.starts_with("* ")
        || trimmed.starts_with("--")
}
