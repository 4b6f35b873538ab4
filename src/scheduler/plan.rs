//! 调度计划：每日对话时间点与爬取到期判断（纯函数，时间均为 UTC）

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use rand::Rng;

use crate::store::CrawlCheckpoint;

/// 每日活跃时段 `[start_hour, end_hour)`，end_hour 可为 24
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveWindow {
    start_hour: u32,
    end_hour: u32,
}

impl ActiveWindow {
    pub fn new(start_hour: u32, end_hour: u32) -> Self {
        let start_hour = start_hour.min(23);
        let end_hour = end_hour.min(24);
        let end_hour = if end_hour <= start_hour { start_hour + 1 } else { end_hour };
        Self { start_hour, end_hour }
    }

    pub fn start_hour(&self) -> u32 {
        self.start_hour
    }

    pub fn end_hour(&self) -> u32 {
        self.end_hour
    }

    /// 某日的时段起止
    pub fn bounds(&self, date: NaiveDate) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        Some((at_hour(date, self.start_hour)?, at_hour(date, self.end_hour)?))
    }
}

fn at_hour(date: NaiveDate, hour: u32) -> Option<DateTime<Utc>> {
    let naive = if hour >= 24 {
        date.succ_opt()?.and_hms_opt(0, 0, 0)?
    } else {
        date.and_hms_opt(hour, 0, 0)?
    };
    Some(Utc.from_utc_datetime(&naive))
}

/// 从 `now` 起的计划：今天时段的剩余部分；今天时段已过或剩余时间排不下时为明天的完整时段
pub fn plan_conversations<R: Rng + ?Sized>(
    now: DateTime<Utc>,
    window: ActiveWindow,
    count: usize,
    rng: &mut R,
) -> (NaiveDate, Vec<DateTime<Utc>>) {
    let today = now.date_naive();
    let today_open = window.bounds(today).is_some_and(|(_, end)| now < end);
    if today_open {
        let plan = plan_for_date(today, Some(now), window, count, rng);
        if !plan.is_empty() {
            return (today, plan);
        }
    }
    next_day_plan(today, window, count, rng)
}

/// `date` 次日的完整计划
pub fn next_day_plan<R: Rng + ?Sized>(
    date: NaiveDate,
    window: ActiveWindow,
    count: usize,
    rng: &mut R,
) -> (NaiveDate, Vec<DateTime<Utc>>) {
    let next = date.succ_opt().unwrap_or(date);
    (next, plan_for_date(next, None, window, count, rng))
}

/// 某日时段（从 `from` 开始，若晚于时段起点）均分为 `count` 段，每段取一个随机时刻；升序
pub fn plan_for_date<R: Rng + ?Sized>(
    date: NaiveDate,
    from: Option<DateTime<Utc>>,
    window: ActiveWindow,
    count: usize,
    rng: &mut R,
) -> Vec<DateTime<Utc>> {
    let Some((start, end)) = window.bounds(date) else {
        return Vec::new();
    };
    let start = from.map_or(start, |f| f.max(start));
    if count == 0 || start >= end {
        return Vec::new();
    }

    let slot_ms = (end - start).num_milliseconds() / count as i64;
    if slot_ms <= 0 {
        return Vec::new();
    }
    (0..count as i64)
        .map(|i| start + Duration::milliseconds(i * slot_ms + rng.gen_range(0..slot_ms)))
        .collect()
}

/// 距上次爬取是否已满一个周期（从未爬取过即到期）
pub fn crawl_due(checkpoint: &CrawlCheckpoint, now: DateTime<Utc>, period: Duration) -> bool {
    match checkpoint.last_crawl_timestamp {
        None => true,
        Some(last) => now - last >= period,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::CrawlStatus;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn test_plan_spreads_one_per_slot_in_window() {
        let mut rng = StdRng::seed_from_u64(11);
        let window = ActiveWindow::new(9, 21);
        let now = utc(2026, 3, 2, 6, 0);
        let (date, plan) = plan_conversations(now, window, 3, &mut rng);

        assert_eq!(date, now.date_naive());
        assert_eq!(plan.len(), 3);
        // 12 小时均分为 3 段，各段内一个
        for (i, t) in plan.iter().enumerate() {
            let slot_start = utc(2026, 3, 2, 9 + 4 * i as u32, 0);
            assert!(*t >= slot_start && *t < slot_start + Duration::hours(4), "{t} outside slot {i}");
        }
    }

    #[test]
    fn test_plan_uses_remainder_of_today() {
        let mut rng = StdRng::seed_from_u64(2);
        let now = utc(2026, 3, 2, 15, 30);
        let (_, plan) = plan_conversations(now, ActiveWindow::new(9, 23), 4, &mut rng);
        assert_eq!(plan.len(), 4);
        assert!(plan.iter().all(|t| *t >= now && *t < utc(2026, 3, 2, 23, 0)));
        assert!(plan.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_plan_rolls_to_tomorrow_after_window() {
        let mut rng = StdRng::seed_from_u64(3);
        let now = utc(2026, 3, 2, 23, 10);
        let (date, plan) = plan_conversations(now, ActiveWindow::new(9, 23), 2, &mut rng);
        assert_eq!(date, now.date_naive().succ_opt().unwrap());
        assert!(plan.iter().all(|t| *t >= utc(2026, 3, 3, 9, 0) && *t < utc(2026, 3, 3, 23, 0)));
    }

    #[test]
    fn test_plan_rolls_to_tomorrow_when_remainder_too_short() {
        let mut rng = StdRng::seed_from_u64(5);
        let window = ActiveWindow::new(9, 21);
        // 距时段结束只剩 1ms，3 个时段排不下
        let now = utc(2026, 3, 2, 21, 0) - Duration::milliseconds(1);
        let (date, plan) = plan_conversations(now, window, 3, &mut rng);

        assert_eq!(date, utc(2026, 3, 3, 0, 0).date_naive());
        assert_eq!(plan.len(), 3);
        assert!(plan.iter().all(|t| *t >= utc(2026, 3, 3, 9, 0) && *t < utc(2026, 3, 3, 21, 0)));
    }

    #[test]
    fn test_next_day_plan_covers_full_window() {
        let mut rng = StdRng::seed_from_u64(6);
        let (date, plan) = next_day_plan(utc(2026, 3, 2, 0, 0).date_naive(), ActiveWindow::new(9, 21), 2, &mut rng);
        assert_eq!(date, utc(2026, 3, 3, 0, 0).date_naive());
        assert_eq!(plan.len(), 2);
        assert!(plan[0] < utc(2026, 3, 3, 15, 0) && plan[1] >= utc(2026, 3, 3, 15, 0));
    }

    #[test]
    fn test_window_until_midnight_and_zero_count() {
        let mut rng = StdRng::seed_from_u64(4);
        let window = ActiveWindow::new(20, 30);
        assert_eq!(window.end_hour(), 24);
        let plan = plan_for_date(utc(2026, 3, 2, 0, 0).date_naive(), None, window, 2, &mut rng);
        assert!(plan.iter().all(|t| *t >= utc(2026, 3, 2, 20, 0) && *t < utc(2026, 3, 3, 0, 0)));
        assert!(plan_for_date(utc(2026, 3, 2, 0, 0).date_naive(), None, window, 0, &mut rng).is_empty());
    }

    #[test]
    fn test_crawl_due() {
        let now = utc(2026, 3, 9, 12, 0);
        let period = Duration::hours(168);
        assert!(crawl_due(&CrawlCheckpoint::default(), now, period));

        let recent = CrawlCheckpoint {
            last_crawl_timestamp: Some(now - Duration::hours(1)),
            status: CrawlStatus::InProgress,
            ..Default::default()
        };
        assert!(!crawl_due(&recent, now, period));

        let old = CrawlCheckpoint {
            last_crawl_timestamp: Some(now - Duration::hours(168)),
            status: CrawlStatus::Success,
            ..Default::default()
        };
        assert!(crawl_due(&old, now, period));
    }
}
