use std::{collections::HashMap, collections::HashSet, sync::Arc};

use chrono::{Datelike, Months, NaiveDate};
use serde::Serialize;
use uuid::Uuid;

use crate::{
    error::{AppError, AppResult},
    models::{Channel, CollisionQuery, Reservation},
    repository::Store,
};

#[derive(Debug, Clone, Serialize)]
pub struct DayReservation {
    pub reservation_id: Uuid,
    pub channel: Channel,
    pub guest_count: i32,
}

#[derive(Debug, Clone, Serialize)]
pub struct DayOccupancy {
    pub date: NaiveDate,
    pub occupied: bool,
    pub reservations: Vec<DayReservation>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonthView {
    pub year: i32,
    pub month: u32,
    pub days: Vec<DayOccupancy>,
    pub total_reservations: usize,
    pub occupied_days: usize,
    pub days_in_month: usize,
    /// Whole percent, rounded.
    pub occupancy_rate: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BlockedRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub reservation_id: Uuid,
    pub sub_unit_id: Option<Uuid>,
}

#[derive(Clone)]
pub struct CalendarService {
    store: Arc<dyn Store>,
}

impl CalendarService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// True when an active reservation in scope overlaps `[check_in, check_out)`.
    pub async fn check_collision(
        &self,
        property_id: i64,
        sub_unit_id: Option<i64>,
        check_in: NaiveDate,
        check_out: NaiveDate,
        exclude_reservation_id: Option<i64>,
    ) -> AppResult<bool> {
        let query = CollisionQuery {
            property_id,
            sub_unit_id,
            check_in,
            check_out,
            exclude_reservation_id,
        };
        let overlapping = self.store.count_overlapping_reservations(&query).await?;
        Ok(overlapping > 0)
    }

    pub async fn month_view(&self, property_id: i64, year: i32, month: u32) -> AppResult<MonthView> {
        let (first, last) = month_bounds(year, month)?;
        let reservations = self
            .store
            .list_active_reservations_between(property_id, first, last)
            .await?;
        Ok(build_month_view(year, month, first, last, &reservations))
    }

    pub async fn availability(
        &self,
        property_id: i64,
        from: NaiveDate,
        to: NaiveDate,
    ) -> AppResult<Vec<BlockedRange>> {
        if from >= to {
            return Err(AppError::UnprocessableEntity(
                "from must be before to.".to_string(),
            ));
        }
        let reservations = self
            .store
            .list_active_reservations_between(property_id, from, to)
            .await?;
        let sub_units = self
            .store
            .list_sub_units(property_id)
            .await?
            .into_iter()
            .map(|unit| (unit.id, unit.public_id))
            .collect::<HashMap<_, _>>();

        Ok(reservations
            .iter()
            .filter(|reservation| reservation.check_in < to && reservation.check_out > from)
            .map(|reservation| BlockedRange {
                start: reservation.check_in.max(from),
                end: reservation.check_out.min(to),
                reservation_id: reservation.public_id,
                sub_unit_id: reservation
                    .sub_unit_id
                    .and_then(|id| sub_units.get(&id).copied()),
            })
            .collect())
    }
}

fn month_bounds(year: i32, month: u32) -> AppResult<(NaiveDate, NaiveDate)> {
    let invalid = || AppError::UnprocessableEntity("Invalid year/month.".to_string());
    let first = NaiveDate::from_ymd_opt(year, month, 1).ok_or_else(invalid)?;
    let last = first
        .checked_add_months(Months::new(1))
        .and_then(|next| next.pred_opt())
        .ok_or_else(invalid)?;
    Ok((first, last))
}

fn build_month_view(
    year: i32,
    month: u32,
    first: NaiveDate,
    last: NaiveDate,
    reservations: &[Reservation],
) -> MonthView {
    let mut days = Vec::new();
    let mut touching = HashSet::new();
    let mut day = first;
    while day <= last {
        let covering = reservations
            .iter()
            .filter(|reservation| reservation.covers_day(day))
            .collect::<Vec<_>>();
        for reservation in &covering {
            touching.insert(reservation.id);
        }
        days.push(DayOccupancy {
            date: day,
            occupied: !covering.is_empty(),
            reservations: covering
                .iter()
                .map(|reservation| DayReservation {
                    reservation_id: reservation.public_id,
                    channel: reservation.channel,
                    guest_count: reservation.guest_count,
                })
                .collect(),
        });
        match day.succ_opt() {
            Some(next) => day = next,
            None => break,
        }
    }

    let days_in_month = last.day() as usize;
    let occupied_days = days.iter().filter(|day| day.occupied).count();
    let occupancy_rate = if days_in_month == 0 {
        0
    } else {
        ((occupied_days as f64 / days_in_month as f64) * 100.0).round() as u32
    };

    MonthView {
        year,
        month,
        days,
        total_reservations: touching.len(),
        occupied_days,
        days_in_month,
        occupancy_rate,
    }
}
