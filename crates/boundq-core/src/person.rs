use serde::{Deserialize, Serialize};
use std::fmt;

/// Example payload handed between producer and consumer threads.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Person {
    pub name: String,
    pub age: i32,
    pub job_title: String,
}

impl Person {
    pub fn new(name: impl Into<String>, age: i32, job_title: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            age,
            job_title: job_title.into(),
        }
    }
}

impl Default for Person {
    fn default() -> Self {
        Self {
            name: "N/A".to_string(),
            age: -1,
            job_title: "N/A".to_string(),
        }
    }
}

impl fmt::Display for Person {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Person{{{},{},{}}}", self.name, self.age, self.job_title)
    }
}
