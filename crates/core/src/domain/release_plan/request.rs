// Release plan request payload (producer wire format)

use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{weekday_from_code, ArrivalDay, DateRange, PlanType, Reduction, ReleasePlan};
use crate::domain::error::{DomainError, Result};

/// Status written on every generated row (draft)
const ROW_STATUS_DRAFT: u8 = 1;

#[derive(Debug, Clone, Deserialize)]
pub struct ReleasePlanRequest {
    #[serde(default)]
    pub id: u64,
    pub operational_plan: OperationalPlan,
    pub plan_type: Coded,
    pub number_stay_days: Counted,
    #[serde(default)]
    pub number_days_between_arrivals: u32,
    #[serde(default)]
    pub non_arrival_days: Vec<Coded>,
    #[serde(default)]
    pub sanitary_days: u32,
    #[serde(default)]
    pub number_arrival_days: u32,
    #[serde(default)]
    pub stop_period: Option<Period>,
    #[serde(default)]
    pub reducing_period: Option<ReducingPeriod>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OperationalPlan {
    pub sanatorium_id: u64,
    pub date_from: NaiveDate,
    pub date_to: NaiveDate,
    pub department: Department,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Department {
    pub num_of_beds: u32,
    pub department_id: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Coded {
    pub code: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Counted {
    pub count: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Period {
    pub date_from: NaiveDate,
    pub date_to: NaiveDate,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReducingPeriod {
    pub date_from: NaiveDate,
    pub date_to: NaiveDate,
    pub beds: u32,
}

impl ReleasePlanRequest {
    pub fn from_payload(payload: &Value) -> Result<Self> {
        let request: ReleasePlanRequest = serde_json::from_value(payload.clone())
            .map_err(|e| DomainError::ValidationError(format!("malformed release plan: {}", e)))?;

        if request.id == 0 {
            return Err(DomainError::ValidationError(
                "release plan id is missing".to_string(),
            ));
        }
        Ok(request)
    }

    pub fn sanatorium_id(&self) -> u64 {
        self.operational_plan.sanatorium_id
    }

    /// Build and validate the plan
    pub fn to_plan(&self) -> Result<ReleasePlan> {
        let non_arrival_days = self
            .non_arrival_days
            .iter()
            .map(|day| {
                weekday_from_code(day.code).ok_or_else(|| {
                    DomainError::ValidationError(format!(
                        "non-arrival day code {} is not between 1 and 7",
                        day.code
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let plan = ReleasePlan {
            plan_type: PlanType::from_code(self.plan_type.code),
            bed_capacity: self.operational_plan.department.num_of_beds,
            stay_days: self.number_stay_days.count,
            arrival_days: self.number_arrival_days,
            period: DateRange::new(self.operational_plan.date_from, self.operational_plan.date_to),
            stop_period: self
                .stop_period
                .as_ref()
                .map(|p| DateRange::new(p.date_from, p.date_to)),
            reduction: self.reducing_period.as_ref().map(|p| Reduction {
                period: DateRange::new(p.date_from, p.date_to),
                beds: p.beds,
            }),
            sanitary_days: self.sanitary_days,
            days_between_arrivals: self.number_days_between_arrivals,
            non_arrival_days,
        };
        plan.validate()?;
        Ok(plan)
    }

    /// Response rows for a computed schedule
    pub fn rows(&self, plan: &ReleasePlan, schedule: &[ArrivalDay]) -> Vec<Value> {
        schedule
            .iter()
            .map(|day| {
                json!({
                    "voucher_release_plan_id": self.id,
                    "sanatorium_id": self.operational_plan.sanatorium_id,
                    "department_id": self.operational_plan.department.department_id,
                    "arrival_number": day.arrival_number,
                    "arrival_day_number": day.day_number,
                    "arrival_date": day.arrival_date.format("%Y-%m-%d").to_string(),
                    "days_of_stay_count": plan.stay_days,
                    "departure_date": day.departure_date.format("%Y-%m-%d").to_string(),
                    "vouchers_count": day.vouchers,
                    "voucher_number_from": day.voucher_from,
                    "voucher_number_to": day.voucher_to,
                    "days_between_arrivals_count": plan.days_between_arrivals,
                    "sanitary_days_count": day.gap_after,
                    "status": ROW_STATUS_DRAFT,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> Value {
        json!({
            "id": 42,
            "operational_plan": {
                "id": 9,
                "sanatorium_id": 7,
                "name": "string",
                "date_from": "2026-01-01",
                "date_to": "2026-04-09",
                "department": {"num_of_beds": 300, "department_id": 3}
            },
            "plan_type": {"id": 2, "code": 2, "name": "arrival"},
            "number_stay_days": {"id": 1, "count": 14, "name": "14 days", "is_system": true},
            "number_days_between_arrivals": 1,
            "non_arrival_days": [{"id": 1, "code": 1}, {"id": 2, "code": 2}],
            "sanitary_days": 2,
            "number_arrival_days": 5,
            "comment": null,
            "status": {"id": 2, "code": 2}
        })
    }

    #[test]
    fn test_parse_producer_payload() {
        let request = ReleasePlanRequest::from_payload(&payload()).unwrap();
        assert_eq!(request.id, 42);
        assert_eq!(request.sanatorium_id(), 7);

        let plan = request.to_plan().unwrap();
        assert_eq!(plan.plan_type, PlanType::Arrival);
        assert_eq!(plan.bed_capacity, 300);
        assert_eq!(plan.arrival_days, 5);
        assert_eq!(plan.non_arrival_days.len(), 2);
    }

    #[test]
    fn test_missing_plan_id_rejected() {
        let mut body = payload();
        body.as_object_mut().unwrap().remove("id");
        let err = ReleasePlanRequest::from_payload(&body).unwrap_err();
        assert!(err.to_string().contains("id is missing"));
    }

    #[test]
    fn test_missing_field_rejected() {
        let mut body = payload();
        body.as_object_mut().unwrap().remove("operational_plan");
        let err = ReleasePlanRequest::from_payload(&body).unwrap_err();
        assert!(err.to_string().contains("operational_plan"));
    }

    #[test]
    fn test_bad_weekday_code_rejected() {
        let mut body = payload();
        body["non_arrival_days"] = json!([{"code": 9}]);
        let request = ReleasePlanRequest::from_payload(&body).unwrap();
        assert!(request.to_plan().is_err());
    }

    #[test]
    fn test_rows_shape() {
        let request = ReleasePlanRequest::from_payload(&payload()).unwrap();
        let plan = request.to_plan().unwrap();
        let schedule = plan.schedule(1).unwrap();
        let rows = request.rows(&plan, &schedule);

        assert_eq!(rows.len(), schedule.len());
        let first = &rows[0];
        assert_eq!(first["voucher_release_plan_id"], 42);
        assert_eq!(first["department_id"], 3);
        assert_eq!(first["arrival_date"], "2026-01-01");
        assert_eq!(first["days_of_stay_count"], 14);
        assert_eq!(first["status"], 1);
    }
}
