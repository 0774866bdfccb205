use std::collections::BTreeSet;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};

use crate::model::{Session, SessionCategory};

/// Conjunction of optional session predicates. The default matches everything.
///
/// The date bounds and the time-of-day bound are independent: a lower bound
/// of 2024-06-01 09:00 admits a 10:00 session on 2024-06-05 and rejects an
/// 08:00 session on any date. It is not a date-time range.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionFilter {
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
    pub starts_no_earlier_than: Option<NaiveTime>,
    pub categories: Vec<SessionCategory>,
}

impl SessionFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Window from two optional date-times. A missing bound is unbounded; the
    /// start's time of day becomes the lower bound on session start times.
    pub fn between(start: Option<NaiveDateTime>, end: Option<NaiveDateTime>) -> Self {
        Self {
            date_from: start.map(|s| s.date()),
            date_to: end.map(|e| e.date()),
            starts_no_earlier_than: start.map(|s| s.time()),
            categories: Vec::new(),
        }
    }

    /// Inclusive date bounds.
    pub fn on_dates(mut self, from: Option<NaiveDate>, to: Option<NaiveDate>) -> Self {
        self.date_from = from;
        self.date_to = to;
        self
    }

    pub fn starting_at_or_after(mut self, time: NaiveTime) -> Self {
        self.starts_no_earlier_than = Some(time);
        self
    }

    pub fn with_categories(mut self, categories: impl IntoIterator<Item = SessionCategory>) -> Self {
        self.categories.extend(categories);
        self
    }

    pub fn matches(&self, session: &Session) -> bool {
        self.date_from.is_none_or(|d| session.date >= d)
            && self.date_to.is_none_or(|d| session.date <= d)
            && self
                .starts_no_earlier_than
                .is_none_or(|t| session.time.start >= t)
            && self.matches_categories(session)
    }

    fn matches_categories(&self, session: &Session) -> bool {
        if self.categories.is_empty() {
            return true;
        }
        let names: BTreeSet<&str> = self.categories.iter().map(SessionCategory::name).collect();
        session.has_category_named(&names)
    }
}
