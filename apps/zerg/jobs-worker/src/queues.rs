use std::env;
use thiserror::Error;

const DEFAULT_QUEUES: &str = "default:5";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueSpecError {
    #[error("Queue entry '{0}' has an empty name")]
    EmptyName(String),

    #[error("Queue entry '{entry}' has an invalid concurrency: {details}")]
    InvalidConcurrency { entry: String, details: String },
}

/// A queue to serve and its number of worker slots
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub concurrency: usize,
}

/// Queues from `JOBS_QUEUES`, e.g. `default:5,mailers:2`.
///
/// A missing concurrency means 1.
pub fn queues_from_env() -> Result<Vec<QueueSpec>, QueueSpecError> {
    let raw = env::var("JOBS_QUEUES").unwrap_or_else(|_| DEFAULT_QUEUES.to_string());
    parse_queues(&raw)
}

pub fn parse_queues(raw: &str) -> Result<Vec<QueueSpec>, QueueSpecError> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (name, concurrency) = match entry.split_once(':') {
                Some((name, concurrency)) => {
                    let concurrency = concurrency.trim().parse::<usize>().map_err(|e| {
                        QueueSpecError::InvalidConcurrency {
                            entry: entry.to_string(),
                            details: e.to_string(),
                        }
                    })?;
                    (name.trim(), concurrency)
                }
                None => (entry, 1),
            };

            if name.is_empty() {
                return Err(QueueSpecError::EmptyName(entry.to_string()));
            }
            Ok(QueueSpec {
                name: name.to_string(),
                concurrency,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_queues() {
        assert_eq!(
            parse_queues("default:5, mailers:2,reports").unwrap(),
            vec![
                QueueSpec {
                    name: "default".into(),
                    concurrency: 5
                },
                QueueSpec {
                    name: "mailers".into(),
                    concurrency: 2
                },
                QueueSpec {
                    name: "reports".into(),
                    concurrency: 1
                },
            ]
        );
    }

    #[test]
    fn test_parse_queues_errors() {
        assert_eq!(
            parse_queues(":3"),
            Err(QueueSpecError::EmptyName(":3".into()))
        );
        assert!(matches!(
            parse_queues("default:many"),
            Err(QueueSpecError::InvalidConcurrency { .. })
        ));
    }

    #[test]
    fn test_queues_from_env_default() {
        temp_env::with_var_unset("JOBS_QUEUES", || {
            let queues = queues_from_env().unwrap();
            assert_eq!(queues.len(), 1);
            assert_eq!(queues[0].name, "default");
            assert_eq!(queues[0].concurrency, 5);
        });
    }
}
