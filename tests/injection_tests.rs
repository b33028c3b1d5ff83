// Command injection heuristics over extracted trees


use std::path::PathBuf;

use fwscope::{Location, create_image, find_injections};
use test_support::*;

const VULNERABLE_CGI: &str = r#"#!/bin/sh
# diagnostics page
echo "Content-type: text/plain"
echo ""
target=$(echo "$QUERY_STRING" | sed 's/host=//')
sh -c "ping -c 4 $target"
"#;

const CLEAN_SCRIPT: &str = r#"#!/bin/sh
# start the web server with fixed arguments
/usr/sbin/httpd -p 80 -h /www
exit 0
"#;

#[test]
fn test_concatenated_command_is_reported_with_location() {
    let dir = tempfile::tempdir().unwrap();
    write_file(
        &dir.path().join("usr/lib/lua/diag.lua"),
        b"local host = arg[1]\nos.execute(\"ping -c 1 \" .. host)\n",
    );

    let findings = find_injections(dir.path(), &Default::default());
    assert_eq!(findings.len(), 1, "{:?}", findings);
    let finding = &findings[0];
    assert_eq!(finding.path, PathBuf::from("usr/lib/lua/diag.lua"));
    assert_eq!(finding.location, Location::Line(2));
    assert_eq!(finding.rule, "exec-string-concat");
    assert_eq!(finding.excerpt, "os.execute(\"ping -c 1 \" .. host)");
}

#[test]
fn test_shell_interpolation_in_cgi() {
    let dir = tempfile::tempdir().unwrap();
    write_file(&dir.path().join("www/cgi-bin/ping.cgi"), VULNERABLE_CGI.as_bytes());

    let findings = find_injections(dir.path(), &Default::default());
    let rules: Vec<&str> = findings.iter().map(|f| f.rule).collect();
    assert!(rules.contains(&"shell-c-interpolation"), "{:?}", rules);
    assert!(rules.contains(&"cgi-input-substitution"), "{:?}", rules);
    assert!(findings.iter().all(|f| f.location != Location::Line(2)));
}

#[test]
fn test_clean_tree_has_no_findings() {
    let dir = tempfile::tempdir().unwrap();
    write_file(&dir.path().join("etc/init.d/httpd"), CLEAN_SCRIPT.as_bytes());
    write_file(&dir.path().join("etc/hostname"), b"router\n");

    assert!(find_injections(dir.path(), &Default::default()).is_empty());
}

#[test]
fn test_commented_out_code_is_ignored() {
    let dir = tempfile::tempdir().unwrap();
    write_file(
        &dir.path().join("usr/www/admin.php"),
        b"<?php\n// system(\"ping \" . $_GET['ip']);\n# shell_exec(\"rm \" . $f);\n?>\n",
    );

    assert!(find_injections(dir.path(), &Default::default()).is_empty());
}

#[test]
fn test_format_then_exec_in_c_source() {
    let dir = tempfile::tempdir().unwrap();
    let source = "void do_ping(const char *ip) {\n    char cmd[128];\n    snprintf(cmd, sizeof(cmd), \"ping -c 1 %s\", ip);\n    system(cmd);\n}\n";
    write_file(&dir.path().join("src/ping.c"), source.as_bytes());

    let findings = find_injections(dir.path(), &Default::default());
    assert_eq!(findings.len(), 1, "{:?}", findings);
    assert_eq!(findings[0].rule, "format-then-exec");
    assert_eq!(findings[0].location, Location::Line(4));
    assert!(findings[0].rationale.contains("line 3"));
}

#[test]
fn test_findings_follow_walk_order() {
    let dir = tempfile::tempdir().unwrap();
    write_file(&dir.path().join("www/b.cgi"), b"#!/bin/sh\neval \"$CMD\"\n");
    write_file(&dir.path().join("www/a.cgi"), b"#!/bin/sh\neval \"$CMD\"\n");
    write_file(&dir.path().join("bin/c.sh"), b"#!/bin/sh\neval \"$CMD\"\n");

    let paths: Vec<PathBuf> = find_injections(dir.path(), &Default::default())
        .into_iter()
        .map(|f| f.path)
        .collect();
    assert_eq!(
        paths,
        vec![
            PathBuf::from("bin/c.sh"),
            PathBuf::from("www/a.cgi"),
            PathBuf::from("www/b.cgi")
        ]
    );
}

#[test]
fn test_opaque_binaries_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let mut blob = garbage(11, 2048);
    blob.extend_from_slice(b"system(\"ping \" + host)");
    write_file(&dir.path().join("lib/firmware/blob.bin"), &blob);
    // Looks like ELF but does not parse
    write_file(
        &dir.path().join("bin/broken"),
        b"\x7fELF\x01\x01\x01\0\0sh -c ping %s\0",
    );

    assert!(find_injections(dir.path(), &Default::default()).is_empty());
}

#[test]
fn test_image_reports_rendered_findings() {
    let fixture = squashfs_fixture(&[
        ("www/cgi-bin/ping.cgi", VULNERABLE_CGI),
        ("etc/init.d/httpd", CLEAN_SCRIPT),
    ]);
    let image = create_image(&fixture.image, fixture.config.clone()).unwrap();
    image.extract_fs().unwrap();

    let findings = image.get_command_injections().unwrap();
    assert!(!findings.is_empty());
    assert!(
        findings
            .iter()
            .all(|f| f.starts_with("www/cgi-bin/ping.cgi:")),
        "{:?}",
        findings
    );
    assert!(findings.iter().any(|f| f.contains("[shell-c-interpolation]")));
}

#[test]
fn test_binary_command_template_behind_exec_import() {
    let dir = tempfile::tempdir().unwrap();
    let elf = dynamic_elf("system", b"\0usage: diag <host>\0ping -c 1 %s\0");
    write_file(&dir.path().join("usr/sbin/diagd"), &elf);

    let findings = find_injections(dir.path(), &Default::default());
    assert_eq!(findings.len(), 1, "{:?}", findings);
    let finding = &findings[0];
    assert_eq!(finding.path, PathBuf::from("usr/sbin/diagd"));
    assert_eq!(finding.rule, "binary-command-template");
    let template_at = ELF_STRING_OFFSET + b"\0usage: diag <host>\0".len();
    assert_eq!(finding.location, Location::Offset(template_at as u64));
    assert_eq!(finding.excerpt, "ping -c 1 %s");
    assert!(finding.rationale.contains("imports system"), "{}", finding.rationale);
    assert!(finding.to_string().starts_with(&format!("usr/sbin/diagd:0x{:x}: ", template_at)));
}

#[test]
fn test_binary_template_without_exec_import_is_quiet() {
    let dir = tempfile::tempdir().unwrap();
    let elf = dynamic_elf("strlen", b"\0ping -c 1 %s\0");
    write_file(&dir.path().join("usr/sbin/diagd"), &elf);

    assert!(find_injections(dir.path(), &Default::default()).is_empty());
}

#[test]
fn test_utf8_commented_script_is_scanned() {
    let dir = tempfile::tempdir().unwrap();
    let script = "-- 诊断页面：执行网络连通性测试并返回结果给管理界面，请勿修改此文件\nos.execute(\"ping -c 1 \" .. host)\n";
    write_file(&dir.path().join("usr/lib/lua/luci/diag.lua"), script.as_bytes());

    let findings = find_injections(dir.path(), &Default::default());
    assert_eq!(findings.len(), 1, "{:?}", findings);
    assert_eq!(findings[0].location, Location::Line(2));
}
