#[cfg(test)]
mod tests {
    use super::super::*;
    use readmit_common::ScoringMode;

    #[test]
    fn test_flag_beats_env_and_local_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(DEFAULT_CONFIG_FILE), "").unwrap();
        let flag = PathBuf::from("custom.toml");
        let source = resolve(Some(&flag), Some("env.toml".into()), dir.path());
        assert_eq!(source, ConfigSource::Flag(flag));
    }

    #[test]
    fn test_env_beats_local_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(DEFAULT_CONFIG_FILE), "").unwrap();
        let source = resolve(None, Some("env.toml".into()), dir.path());
        assert_eq!(source, ConfigSource::Env(PathBuf::from("env.toml")));
    }

    #[test]
    fn test_local_file_then_defaults() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(resolve(None, None, dir.path()), ConfigSource::Defaults);
        assert_eq!(resolve(None, Some("  ".into()), dir.path()), ConfigSource::Defaults);

        let local = dir.path().join(DEFAULT_CONFIG_FILE);
        std::fs::write(&local, "").unwrap();
        assert_eq!(resolve(None, None, dir.path()), ConfigSource::WorkingDir(local));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("readmit.toml");
        std::fs::write(
            &path,
            "[gbm]\niterations = 300\n\n[inference]\nmode = \"tree\"\n\n[bands]\nlow_upper = 0.25\nhigh_lower = 0.6\n",
        )
        .unwrap();
        let config = load(&ConfigSource::Flag(path)).unwrap();
        assert_eq!(config.gbm.iterations, 300);
        assert_eq!(config.gbm.max_depth, 8);
        assert_eq!(config.inference.mode, ScoringMode::Tree);
        assert_eq!(config.bands.low_upper, 0.25);
        assert_eq!(config.dataset.outcome_column, "readmitted");
    }

    #[test]
    fn test_json_config_and_validation() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("engine.json");
        std::fs::write(&good, r#"{"split": {"seed": 7}}"#).unwrap();
        assert_eq!(load(&ConfigSource::Env(good)).unwrap().split.seed, 7);

        let bad = dir.path().join("bad.toml");
        std::fs::write(&bad, "[split]\nvalidation_fraction = 1.5\n").unwrap();
        assert!(load(&ConfigSource::Flag(bad)).is_err());
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let err = load(&ConfigSource::Flag(PathBuf::from("/nonexistent/readmit.toml"))).unwrap_err();
        assert!(err.to_string().contains("Config file not found"));
    }
}
