// Turns the one-line train summaries some booking clients return into
// structured candidates. Kept apart from the executor: text scraping breaks
// whenever a site changes its wording, the retry engine should not.

use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, warn};

use crate::models::TrainCandidate;

// `[KTX] 20250101, 서울~부산(09:00~11:40) 특실 예약가능, 일반실 예약가능 59,800원`
static SUMMARY_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\[(?P<train_type>.*?)\]\s+.*?,\s+(?P<dep_station>.*?)~(?P<arr_station>.*?)\((?P<dep_time>\d{2}:\d{2})~(?P<arr_time>\d{2}:\d{2})\)\s+.*?\s*(?P<fare>[\d,]+)원",
    )
    .expect("summary line pattern is valid")
});

const SOLD_OUT: &str = "매진";
const SPECIAL_CLASS: &str = "특실";
const GENERAL_CLASS: &str = "일반실";

pub trait TrainParser: Send + Sync {
    fn parse(&self, raw_entries: &[String], run_date: &str) -> Vec<TrainCandidate>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SummaryLineParser;

impl SummaryLineParser {
    pub fn new() -> Self {
        Self
    }

    pub fn parse_line(&self, line: &str, run_date: &str) -> Option<TrainCandidate> {
        let caps = SUMMARY_LINE.captures(line)?;

        let train_type = caps["train_type"].trim().to_string();
        let dep_time_raw = &caps["dep_time"];
        let dep_time = dep_time_raw.replace(':', "");
        let arr_time = caps["arr_time"].replace(':', "");
        let fare = match caps["fare"].replace(',', "").parse::<f64>() {
            Ok(fare) => fare,
            Err(e) => {
                warn!(line, error = %e, "Unreadable fare in train summary");
                return None;
            }
        };

        let sold_out = line.contains(SOLD_OUT);
        let has_special = line.contains(SPECIAL_CLASS);
        let has_general = line.contains(GENERAL_CLASS);

        // "KTX-산천" and "KTX" share a number prefix
        let prefix = train_type.split('-').next().unwrap_or(&train_type);
        let train_no = format!("{prefix}-{dep_time_raw}");
        let train_id = format!("{train_no}_{run_date}_{dep_time}");

        Some(TrainCandidate {
            train_no,
            train_type,
            dep_time,
            arr_time,
            dep_station: caps["dep_station"].trim().to_string(),
            arr_station: caps["arr_station"].trim().to_string(),
            is_available: !sold_out,
            special_seat_available: has_special && !sold_out,
            // lines naming neither class describe a general-only train
            general_seat_available: (has_general || !has_special) && !sold_out,
            fare,
            run_date: run_date.to_string(),
            train_id,
        })
    }
}

impl TrainParser for SummaryLineParser {
    fn parse(&self, raw_entries: &[String], run_date: &str) -> Vec<TrainCandidate> {
        let trains: Vec<_> = raw_entries
            .iter()
            .filter_map(|line| {
                let parsed = self.parse_line(line, run_date);
                if parsed.is_none() {
                    warn!(line = %line, "Failed to parse train summary");
                }
                parsed
            })
            .collect();

        debug!(
            parsed = trains.len(),
            total = raw_entries.len(),
            "Parsed train summaries"
        );
        trains
    }
}
