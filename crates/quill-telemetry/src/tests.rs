//! End-to-end tests for the pipeline

#[cfg(test)]
mod integration_tests {
    use crate::{
        context::{self, CorrelationContext, REQUEST_ID, TRACE_ID},
        event::{EventBuilder, Level},
        rotation::{LogFileManager, ManualClock},
        system::{Logger, TelemetrySystem},
        TelemetryConfig,
    };
    use chrono::{DateTime, TimeZone, Utc};
    use serde_json::{json, Map, Value};
    use serial_test::serial;
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn file_config(dir: &Path) -> TelemetryConfig {
        let mut config = TelemetryConfig::default();
        config.service.name = "users-api".to_string();
        config.logging.log_dir = dir.to_path_buf();
        config.logging.fallback_log_dir = dir.join("fallback");
        config.logging.console_enabled = false;
        config.logging.file_enabled = true;
        config
    }

    fn read_lines(path: &Path) -> Vec<Value> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[test]
    fn test_user_fetched_scenario() {
        let temp_dir = TempDir::new().unwrap();
        let logger = Logger::from_config(file_config(temp_dir.path())).unwrap();

        {
            let _bound = context::bind_scoped([(REQUEST_ID, "r-1")]);
            let mut sections = Map::new();
            sections.insert("context".to_string(), json!({ "user_id": 7 }));
            logger.log("INFO", "user_fetched", None, sections);
        }
        logger.flush();

        let raw = std::fs::read_to_string(temp_dir.path().join("app.log")).unwrap();
        assert_eq!(raw.lines().count(), 1);
        assert!(raw.contains("\"event\":\"user_fetched\""));
        assert!(raw.contains("\"context\":{\"user_id\":7}"));
        assert!(raw.contains("\"request_id\":\"r-1\""));

        let line: Value = serde_json::from_str(raw.trim_end()).unwrap();
        let timestamp = line["timestamp"].as_str().unwrap();
        assert!(DateTime::parse_from_rfc3339(timestamp).is_ok());
        assert_eq!(line["service"], json!("users-api"));
        assert!(context::current().get(REQUEST_ID).is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_units_never_share_trace_ids() {
        let temp_dir = TempDir::new().unwrap();
        let logger = Logger::from_config(file_config(temp_dir.path())).unwrap();

        let mut handles = Vec::new();
        for (unit, trace) in [(1, "t1"), (2, "t2")] {
            let logger = logger.clone();
            handles.push(tokio::spawn(context::scope(
                CorrelationContext::new(),
                async move {
                    context::bind([(TRACE_ID, trace)]);
                    for i in 0..50 {
                        logger
                            .event(Level::Info, "work_step")
                            .context(json!({ "unit": unit, "step": i }))
                            .emit_to(&logger);
                        if i % 10 == 0 {
                            tokio::time::sleep(Duration::from_millis(1)).await;
                        }
                    }
                },
            )));
        }
        for joined in futures::future::join_all(handles).await {
            joined.unwrap();
        }
        logger.flush();

        let lines = read_lines(&temp_dir.path().join("app.log"));
        assert_eq!(lines.len(), 100);
        for line in lines {
            let expected = if line["context"]["unit"] == json!(1) { "t1" } else { "t2" };
            assert_eq!(line[TRACE_ID], json!(expected));
        }
    }

    #[test]
    fn test_every_level_and_section_combination_succeeds() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = file_config(temp_dir.path());
        config.logging.min_level = Level::Debug;
        let logger = Logger::from_config(config).unwrap();

        let sections = [
            ("http", json!({ "method": "GET", "path": "/" })),
            ("query", json!({ "sql": "SELECT 1", "params": [] })),
            ("error", json!({ "type": "Boom", "message": "bad" })),
            ("context", json!({ "user_id": null, "tags": ["a", "ü"] })),
        ];

        let mut expected = 0;
        for level in Level::ALL {
            for mask in 0..(1u8 << sections.len()) {
                let mut payload = Map::new();
                for (bit, (name, value)) in sections.iter().enumerate() {
                    if mask & (1 << bit) != 0 {
                        payload.insert(name.to_string(), value.clone());
                    }
                }
                let message = (mask % 2 == 0).then_some("with message");
                logger.log(level, "combination", message, payload);
                expected += 1;
            }
        }
        logger.flush();

        let lines = read_lines(&temp_dir.path().join("app.log"));
        assert_eq!(lines.len(), expected);
        assert_eq!(logger.health().events_emitted as usize, expected);
    }

    #[test]
    fn test_error_event_gets_location_and_trace() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = file_config(temp_dir.path());
        config.enrichment.app_root = Some(std::env::current_dir().unwrap());
        let logger = Logger::from_config(config).unwrap();

        let err = "not a number".parse::<u32>().unwrap_err();
        EventBuilder::new(Level::Error, "parse_failed")
            .message("Could not parse quantity")
            .exception(&err)
            .emit_to(&logger);
        logger.flush();

        let lines = read_lines(&temp_dir.path().join("app.log"));
        let error = &lines[0]["error"];
        assert_eq!(error["type"], json!("ParseIntError"));
        assert!(error["stack_trace"].is_string());
        if let Some(file) = error["location"]["file"].as_str() {
            assert!(!file.contains(".cargo/registry"));
            assert!(!file.contains("/rustc/"));
        }
    }

    #[test]
    fn test_rotation_through_the_logger() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = file_config(temp_dir.path());
        config.rotation.retention_files = 2;

        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 7, 1, 23, 59, 0).unwrap(),
        ));
        let logger = Logger::builder(config).clock(clock.clone()).build().unwrap();

        logger.log(Level::Info, "day_one", None, Map::new());
        for _ in 0..3 {
            clock.advance(chrono::Duration::days(1));
            logger.log(Level::Info, "next_day", None, Map::new());
        }

        let rotation = logger.health().rotation.unwrap();
        assert_eq!(rotation.rotations, 3);
        assert_eq!(rotation.rotated_files.len(), 2);

        let on_disk = LogFileManager::find_rotated_files(temp_dir.path(), "app").unwrap();
        let dates: Vec<_> = on_disk.iter().map(|f| f.date.to_string()).collect();
        assert_eq!(dates, vec!["2024-07-02", "2024-07-03"]);

        // Timestamps follow the same clock
        let current = read_lines(&temp_dir.path().join("app.log"));
        assert!(current[0]["timestamp"].as_str().unwrap().starts_with("2024-07-04T23:59:00"));
    }

    #[test]
    #[serial]
    fn test_global_init_writes_to_file() {
        let temp_dir = TempDir::new().unwrap();
        let guard = TelemetrySystem::init(file_config(temp_dir.path())).unwrap();

        crate::event(Level::Warning, "disk_low")
            .context(json!({ "free_mb": 120 }))
            .emit();
        crate::log(Level::Info, "checked", Some("Disk checked"), Map::new());
        drop(guard);

        let lines = read_lines(&temp_dir.path().join("app.log"));
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["level"], json!("WARNING"));
        assert_eq!(lines[1]["message"], json!("Disk checked"));
    }
}
