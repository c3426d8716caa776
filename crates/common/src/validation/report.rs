use garde::Report;

/// One `path: message` entry per violation, joined with `; `
pub(crate) fn format_validation_report(report: &Report) -> String {
    let mut entries = Vec::new();
    for (path, error) in report.iter() {
        let path = path.to_string();
        let entry = match path.as_str() {
            "" => error.message().to_string(),
            field => format!("{}: {}", field, error.message()),
        };
        entries.push(entry);
    }
    entries.join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use garde::Validate;

    #[test]
    fn test_report_lists_every_offending_field() {
        let config = PipelineConfig {
            batch_limit: 0,
            subscribe_topic: String::new(),
            ..Default::default()
        };
        let report = config.validate().unwrap_err();
        let formatted = format_validation_report(&report);

        assert!(formatted.contains("batch_limit: "));
        assert!(formatted.contains("subscribe_topic: "));
        assert_eq!(formatted.matches("; ").count(), 1);
    }
}
