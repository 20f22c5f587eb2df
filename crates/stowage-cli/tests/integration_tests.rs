//! Integration tests for CLI commands

use std::io::Write;
use std::path::Path;
use std::process::{Command, Output, Stdio};

/// Helper to run stowage command with an isolated config
fn stowage(args: &[&str], config_home: &Path) -> Output {
    stowage_with_input(args, config_home, &[], None)
}

fn stowage_with_input(args: &[&str], config_home: &Path, envs: &[(&str, &Path)], stdin: Option<&str>) -> Output {
    let mut command = Command::new(env!("CARGO_BIN_EXE_stowage"));
    command
        .args(args)
        .env("XDG_CONFIG_HOME", config_home)
        .env_remove("STOWAGE_CONFIG")
        .env_remove("STOWAGE_CACHE_DIR")
        .env_remove("STOWAGE_FEED_USERNAME")
        .env_remove("STOWAGE_FEED_PASSWORD")
        .env_remove("STOWAGE_CREDENTIAL_PASSWORD")
        .env_remove("DOCKER_CONFIG")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for (name, value) in envs {
        command.env(name, value);
    }

    let mut child = command.spawn().expect("Failed to execute stowage");
    if let Some(input) = stdin {
        child
            .stdin
            .take()
            .unwrap()
            .write_all(input.as_bytes())
            .unwrap();
    }
    child.wait_with_output().expect("Failed to wait for stowage")
}

mod general {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_help_lists_commands() {
        let temp = TempDir::new().unwrap();
        let output = stowage(&["--help"], temp.path());

        assert!(output.status.success());
        let stdout = String::from_utf8_lossy(&output.stdout);
        assert!(stdout.contains("download"));
        assert!(stdout.contains("credential-helper"));
        assert!(stdout.contains("cache"));
    }

    #[test]
    fn test_unsupported_feed_type_is_usage_error() {
        let temp = TempDir::new().unwrap();
        let cache = temp.path().join("cache");
        let output = stowage(
            &[
                "download",
                "--feed-type",
                "ftp",
                "--feed-id",
                "feeds-1",
                "--feed-uri",
                "ftp://example.com",
                "--package",
                "pkg",
                "--version",
                "1.0.0",
                "--cache-dir",
                cache.to_str().unwrap(),
            ],
            temp.path(),
        );

        assert_eq!(output.status.code(), Some(64));
        let stderr = String::from_utf8_lossy(&output.stderr);
        assert!(stderr.contains("Unsupported feed type: ftp"));
    }

    #[test]
    fn test_invalid_backoff_rejected_by_parser() {
        let temp = TempDir::new().unwrap();
        let output = stowage(
            &[
                "download",
                "--feed-type",
                "npm",
                "--feed-id",
                "feeds-1",
                "--feed-uri",
                "https://registry.npmjs.org",
                "--package",
                "left-pad",
                "--version",
                "1.0.0",
                "--backoff",
                "soon",
            ],
            temp.path(),
        );

        assert!(!output.status.success());
        let stderr = String::from_utf8_lossy(&output.stderr);
        assert!(stderr.contains("invalid duration"));
    }
}

mod download_command {
    use super::*;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test(flavor = "multi_thread")]
    async fn test_download_then_find_in_cache() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/left-pad"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "name": "left-pad",
                "versions": {"1.3.0": {"dist": {"tarball": format!("{}/left-pad-1.3.0.tgz", server.uri())}}}
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/left-pad-1.3.0.tgz"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"tarball".to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        let temp = TempDir::new().unwrap();
        let config_home = temp.path().to_path_buf();
        let cache = temp.path().join("cache");
        let cache_arg = cache.to_str().unwrap().to_string();
        let feed_uri = server.uri();

        let download_args = vec![
            "download".to_string(),
            "--feed-type".into(),
            "npm".into(),
            "--feed-id".into(),
            "feeds-npm".into(),
            "--feed-uri".into(),
            feed_uri,
            "--package".into(),
            "left-pad".into(),
            "--version".into(),
            "1.3.0".into(),
            "--cache-dir".into(),
            cache_arg.clone(),
            "--attempts".into(),
            "1".into(),
            "--json".into(),
        ];

        let home = config_home.clone();
        let output = tokio::task::spawn_blocking(move || {
            let args: Vec<&str> = download_args.iter().map(String::as_str).collect();
            stowage(&args, &home)
        })
        .await
        .unwrap();

        assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
        let json: serde_json::Value =
            serde_json::from_slice(&output.stdout).expect("Output should be valid JSON");
        assert_eq!(json["packageId"], "left-pad");
        assert_eq!(json["extension"], ".tgz");
        assert_eq!(json["size"], 7);
        let file = json["fullFilePath"].as_str().unwrap();
        assert!(Path::new(file).starts_with(cache.join("feeds-npm")));

        let output = tokio::task::spawn_blocking(move || {
            stowage(
                &[
                    "cache",
                    "find",
                    "--feed-id",
                    "feeds-npm",
                    "--package",
                    "left-pad",
                    "--version",
                    "1.3.0",
                    "--cache-dir",
                    &cache_arg,
                    "--json",
                ],
                &config_home,
            )
        })
        .await
        .unwrap();

        assert!(output.status.success());
        let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
        assert_eq!(json["packageId"], "left-pad");
    }

    #[test]
    fn test_cache_miss_exit_code() {
        let temp = TempDir::new().unwrap();
        let cache = temp.path().join("cache");
        let output = stowage(
            &[
                "cache",
                "find",
                "--feed-id",
                "feeds-npm",
                "--package",
                "left-pad",
                "--version",
                "9.9.9",
                "--cache-dir",
                cache.to_str().unwrap(),
            ],
            temp.path(),
        );

        assert_eq!(output.status.code(), Some(2));
        let stderr = String::from_utf8_lossy(&output.stderr);
        assert!(stderr.contains("left-pad v9.9.9 is not cached for feed feeds-npm"));
    }
}

mod credential_helper_command {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_store_get_erase_round_trip() {
        let temp = TempDir::new().unwrap();
        let docker_config = temp.path().join("docker");
        let envs = [("DOCKER_CONFIG", docker_config.as_path())];

        let output = stowage_with_input(
            &["credential-helper", "store"],
            temp.path(),
            &envs,
            Some(r#"{"ServerURL":"https://registry.example.com","Username":"robot","Secret":"s3cret"}"#),
        );
        assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

        let output = stowage_with_input(
            &["credential-helper", "get"],
            temp.path(),
            &envs,
            Some("https://registry.example.com\n"),
        );
        assert!(output.status.success());
        let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
        assert_eq!(json["Username"], "robot");
        assert_eq!(json["Secret"], "s3cret");

        let output = stowage_with_input(
            &["credential-helper", "erase"],
            temp.path(),
            &envs,
            Some("https://registry.example.com"),
        );
        assert!(output.status.success());

        let output = stowage_with_input(
            &["credential-helper", "get"],
            temp.path(),
            &envs,
            Some("https://registry.example.com"),
        );
        assert!(!output.status.success());
        let stdout = String::from_utf8_lossy(&output.stdout);
        assert!(stdout.contains("credentials not found in native keychain"));
    }

    #[test]
    fn test_requires_docker_config() {
        let temp = TempDir::new().unwrap();
        let output = stowage_with_input(&["credential-helper", "get"], temp.path(), &[], Some("https://r"));
        assert_eq!(output.status.code(), Some(64));
    }
}
