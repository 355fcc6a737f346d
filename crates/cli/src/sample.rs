// Sample release plan requests

use chrono::{Duration, NaiveDate};
use rand::Rng;
use serde_json::{json, Value};

/// Plan type code of a staggered arrival plan
const ARRIVAL_PLAN_CODE: i64 = 2;
const DAILY_PLAN_CODE: i64 = 1;
const PLAN_LENGTH_DAYS: i64 = 99;

/// A random but valid release plan request starting within a month of `today`
pub fn release_plan_request<R: Rng>(rng: &mut R, today: NaiveDate) -> Value {
    let date_from = today + Duration::days(rng.gen_range(0..30));
    let date_to = date_from + Duration::days(PLAN_LENGTH_DAYS);
    let stay_days: u32 = rng.gen_range(10..=21);
    let arrival_plan = rng.gen_bool(0.5);

    let mut request = json!({
        "id": rng.gen_range(1..10_000u64),
        "operational_plan": {
            "sanatorium_id": rng.gen_range(1..100u64),
            "date_from": date_from.format("%Y-%m-%d").to_string(),
            "date_to": date_to.format("%Y-%m-%d").to_string(),
            "department": {
                "num_of_beds": rng.gen_range(50..=400u32),
                "department_id": rng.gen_range(1..20u64),
            },
        },
        "plan_type": {"code": if arrival_plan { ARRIVAL_PLAN_CODE } else { DAILY_PLAN_CODE }},
        "number_stay_days": {"count": stay_days},
        "number_days_between_arrivals": rng.gen_range(0..=2u32),
        "non_arrival_days": [{"code": 7}],
        "sanitary_days": rng.gen_range(0..=3u32),
        "number_arrival_days": rng.gen_range(1..=stay_days.min(7)),
    });

    if rng.gen_bool(0.3) {
        let stop_from = date_from + Duration::days(rng.gen_range(30..50));
        request["stop_period"] = json!({
            "date_from": stop_from.format("%Y-%m-%d").to_string(),
            "date_to": (stop_from + Duration::days(rng.gen_range(1..=7))).format("%Y-%m-%d").to_string(),
        });
    }
    request
}
