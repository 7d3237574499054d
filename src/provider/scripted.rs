// Deterministic provider double. Every login/search/reserve outcome is
// scripted up front and every call is counted, so the engine can be driven
// through exact retry sequences without a real booking site.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::parser::{SummaryLineParser, TrainParser};
use super::{ProviderConnector, ProviderError, ProviderSession, SearchQuery};
use crate::models::{Reservation, TrainCandidate};

#[derive(Debug, Clone)]
pub enum SearchStep {
    Trains(Vec<TrainCandidate>),
    // Raw summary lines, run through the text parser like a scraping client would
    Lines(Vec<String>),
    Fail(ProviderError),
    Panic(String),
}

#[derive(Default)]
struct Script {
    logins: Mutex<VecDeque<Result<(), ProviderError>>>,
    searches: Mutex<VecDeque<SearchStep>>,
    reserves: Mutex<VecDeque<Result<Reservation, ProviderError>>>,
    login_delay_ms: AtomicU64,
    // bumped by expire_sessions(); older sessions report logged out
    generation: AtomicU64,
    connect_count: AtomicUsize,
    login_count: AtomicUsize,
    search_count: AtomicUsize,
    reserve_count: AtomicUsize,
}

// Cheap handle on a shared script; sessions keep their own reference.
#[derive(Default, Clone)]
pub struct ScriptedProvider {
    script: Arc<Script>,
}

impl ScriptedProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_login(&self, result: Result<(), ProviderError>) {
        self.script.logins.lock().push_back(result);
    }

    pub fn push_search(&self, step: SearchStep) {
        self.script.searches.lock().push_back(step);
    }

    pub fn push_reserve(&self, result: Result<Reservation, ProviderError>) {
        self.script.reserves.lock().push_back(result);
    }

    pub fn set_login_delay(&self, delay: Duration) {
        self.script
            .login_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    // Simulates the provider dropping every open session server-side.
    pub fn expire_sessions(&self) {
        self.script.generation.fetch_add(1, Ordering::SeqCst);
    }

    pub fn connects(&self) -> usize {
        self.script.connect_count.load(Ordering::SeqCst)
    }

    pub fn logins(&self) -> usize {
        self.script.login_count.load(Ordering::SeqCst)
    }

    pub fn searches(&self) -> usize {
        self.script.search_count.load(Ordering::SeqCst)
    }

    pub fn reserves(&self) -> usize {
        self.script.reserve_count.load(Ordering::SeqCst)
    }
}

impl ProviderConnector for ScriptedProvider {
    fn connect(&self, _username: &str, _secret: &str) -> Box<dyn ProviderSession> {
        self.script.connect_count.fetch_add(1, Ordering::SeqCst);
        Box::new(ScriptedSession {
            script: Arc::clone(&self.script),
            logged_in: false,
            generation: self.script.generation.load(Ordering::SeqCst),
        })
    }
}

pub struct ScriptedSession {
    script: Arc<Script>,
    logged_in: bool,
    generation: u64,
}

#[async_trait]
impl ProviderSession for ScriptedSession {
    fn is_logged_in(&self) -> bool {
        self.logged_in && self.generation == self.script.generation.load(Ordering::SeqCst)
    }

    async fn authenticate(&mut self) -> Result<(), ProviderError> {
        self.script.login_count.fetch_add(1, Ordering::SeqCst);

        let delay = self.script.login_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let result = self.script.logins.lock().pop_front().unwrap_or(Ok(()));
        self.logged_in = result.is_ok();
        self.generation = self.script.generation.load(Ordering::SeqCst);
        result
    }

    async fn search(&mut self, query: &SearchQuery) -> Result<Vec<TrainCandidate>, ProviderError> {
        self.script.search_count.fetch_add(1, Ordering::SeqCst);

        if !self.is_logged_in() {
            return Err(ProviderError::Authentication("session expired".into()));
        }

        let step = self.script.searches.lock().pop_front();
        match step {
            None => Ok(Vec::new()),
            Some(SearchStep::Trains(trains)) => Ok(trains),
            Some(SearchStep::Lines(lines)) => Ok(SummaryLineParser::new().parse(&lines, &query.date)),
            Some(SearchStep::Fail(err)) => Err(err),
            Some(SearchStep::Panic(msg)) => panic!("{msg}"),
        }
    }

    async fn reserve(&mut self, train: &TrainCandidate) -> Result<Reservation, ProviderError> {
        let n = self.script.reserve_count.fetch_add(1, Ordering::SeqCst) + 1;

        let scripted = self.script.reserves.lock().pop_front();
        scripted.unwrap_or_else(|| {
            Ok(Reservation {
                reservation_id: format!("MOCK{n:05}"),
                summary: format!(
                    "{} {}~{} ({}~{})",
                    train.train_type, train.dep_station, train.arr_station, train.dep_time, train.arr_time
                ),
            })
        })
    }
}

// Minimal candidate for scripting searches: Seoul to Busan on 2025-01-01.
pub fn candidate(train_type: &str, dep_time: &str, has_seat: bool) -> TrainCandidate {
    let train_no = format!("{train_type}-{dep_time}");
    TrainCandidate {
        train_id: format!("{train_no}_20250101_{dep_time}"),
        train_no,
        train_type: train_type.to_string(),
        dep_time: dep_time.to_string(),
        arr_time: "1140".to_string(),
        dep_station: "서울".to_string(),
        arr_station: "부산".to_string(),
        is_available: has_seat,
        special_seat_available: false,
        general_seat_available: has_seat,
        fare: 59800.0,
        run_date: "20250101".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query() -> SearchQuery {
        SearchQuery {
            dep_station: "서울".into(),
            arr_station: "부산".into(),
            date: "20250101".into(),
            time_from: "000000".into(),
            time_to: "235959".into(),
        }
    }

    #[tokio::test]
    async fn test_scripted_steps_play_in_order() {
        let provider = ScriptedProvider::new();
        provider.push_search(SearchStep::Fail(ProviderError::Unavailable("timeout".into())));
        provider.push_search(SearchStep::Lines(vec![
            "[KTX] 20250101, 서울~부산(09:00~11:40) 일반실 예약가능 59,800원".into(),
        ]));

        let mut session = provider.connect("u1", "pw");
        assert!(!session.is_logged_in());
        session.authenticate().await.unwrap();
        assert!(session.is_logged_in());

        assert!(session.search(&query()).await.is_err());
        let trains = session.search(&query()).await.unwrap();
        assert_eq!(trains.len(), 1);
        assert_eq!(trains[0].dep_time, "0900");
        // script exhausted: empty result
        assert!(session.search(&query()).await.unwrap().is_empty());

        let reservation = session.reserve(&trains[0]).await.unwrap();
        assert_eq!(reservation.reservation_id, "MOCK00001");
        assert_eq!(provider.searches(), 3);
        assert_eq!(provider.reserves(), 1);
    }

    #[tokio::test]
    async fn test_expired_session_refuses_search() {
        let provider = ScriptedProvider::new();
        let mut session = provider.connect("u1", "pw");
        session.authenticate().await.unwrap();

        provider.expire_sessions();
        assert!(!session.is_logged_in());
        assert!(matches!(
            session.search(&query()).await,
            Err(ProviderError::Authentication(_))
        ));
    }
}
