//! KIS 주문체결조회 결과를 주문 상태로 변환.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveTime, TimeZone, Utc};
use kset_core::{ErrorRecord, KsetResult, OrderState, OrderStatus};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer};

/// 한국 표준시 (UTC+9).
const KST_OFFSET_SECS: i32 = 9 * 3600;

/// 국내 주식 일별 주문체결 항목.
#[derive(Debug, Clone, Deserialize)]
pub struct KrOrderExecution {
    /// 주문일자 (YYYYMMDD)
    #[serde(rename = "ord_dt")]
    pub order_date: String,
    /// 주문시각 (HHMMSS)
    #[serde(rename = "ord_tmd")]
    pub order_time: String,
    /// 주문번호
    #[serde(rename = "odno")]
    pub order_no: String,
    /// 종목코드
    #[serde(rename = "pdno")]
    pub stock_code: String,
    /// 주문수량
    #[serde(rename = "ord_qty", deserialize_with = "deserialize_decimal")]
    pub order_qty: Decimal,
    /// 총체결수량
    #[serde(rename = "tot_ccld_qty", deserialize_with = "deserialize_decimal")]
    pub filled_qty: Decimal,
    /// 체결평균가
    #[serde(rename = "avg_prvs", deserialize_with = "deserialize_decimal")]
    pub avg_price: Decimal,
    /// 거부수량
    #[serde(rename = "rjct_qty", default, deserialize_with = "deserialize_decimal")]
    pub rejected_qty: Decimal,
    /// 취소여부 (Y/N)
    #[serde(rename = "cncl_yn", default)]
    pub cancel_yn: String,
}

impl KrOrderExecution {
    /// 주문 시각 (KST 기준 문자열을 UTC로 변환).
    pub fn ordered_at(&self) -> KsetResult<DateTime<Utc>> {
        let date = NaiveDate::parse_from_str(&self.order_date, "%Y%m%d").map_err(|e| {
            ErrorRecord::provider("PARSE", format!("주문일자 형식 오류 {}: {}", self.order_date, e), false)
        })?;
        let time = NaiveTime::parse_from_str(&self.order_time, "%H%M%S").map_err(|e| {
            ErrorRecord::provider("PARSE", format!("주문시각 형식 오류 {}: {}", self.order_time, e), false)
        })?;
        let kst = FixedOffset::east_opt(KST_OFFSET_SECS)
            .ok_or_else(|| ErrorRecord::provider("PARSE", "KST 오프셋 생성 실패", false))?;
        kst.from_local_datetime(&date.and_time(time))
            .single()
            .map(|dt| dt.with_timezone(&Utc))
            .ok_or_else(|| ErrorRecord::provider("PARSE", "주문 시각 변환 실패", false))
    }

    /// 거래소 중립적인 주문 상태로 변환합니다.
    ///
    /// `observed_at`은 조회 시각입니다. 체결 내역에는 마지막 변경 시각이 없습니다.
    pub fn to_order_state(&self, observed_at: DateTime<Utc>) -> OrderState {
        let status = if self.order_qty > Decimal::ZERO && self.filled_qty >= self.order_qty {
            OrderStatus::Filled
        } else if self.cancel_yn == "Y" {
            OrderStatus::Cancelled
        } else if self.rejected_qty > Decimal::ZERO && self.filled_qty.is_zero() {
            OrderStatus::Rejected
        } else if self.filled_qty > Decimal::ZERO {
            OrderStatus::PartiallyFilled
        } else {
            OrderStatus::Submitted
        };

        OrderState {
            provider_order_id: self.order_no.clone(),
            client_order_id: None,
            status,
            filled_quantity: self.filled_qty,
            average_fill_price: (self.avg_price > Decimal::ZERO).then_some(self.avg_price),
            updated_at: observed_at,
        }
    }
}

fn deserialize_decimal<'de, D>(deserializer: D) -> Result<Decimal, D::Error>
where
    D: Deserializer<'de>,
{
    let s: String = String::deserialize(deserializer)?;
    let s = s.trim();
    if s.is_empty() || s == "-" {
        return Ok(Decimal::ZERO);
    }
    s.parse::<Decimal>()
        .map_err(|_| serde::de::Error::custom(format!("잘못된 숫자: {}", s)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;
    use rust_decimal_macros::dec;

    const PARTIAL: &str = r#"{
        "ord_dt": "20260302", "ord_tmd": "091502", "odno": "0000117057",
        "pdno": "005930", "ord_qty": "10", "tot_ccld_qty": "4",
        "avg_prvs": "80000", "rjct_qty": "0", "cncl_yn": "N"
    }"#;

    #[test]
    fn test_partial_fill() {
        let exec: KrOrderExecution = serde_json::from_str(PARTIAL).unwrap();
        let state = exec.to_order_state(Utc::now());
        assert_eq!(state.status, OrderStatus::PartiallyFilled);
        assert_eq!(state.filled_quantity, dec!(4));
        assert_eq!(state.average_fill_price, Some(dec!(80000)));
        assert_eq!(state.provider_order_id, "0000117057");
    }

    #[test]
    fn test_ordered_at_converts_kst() {
        let exec: KrOrderExecution = serde_json::from_str(PARTIAL).unwrap();
        let at = exec.ordered_at().unwrap();
        assert_eq!(at.hour(), 0);
        assert_eq!(at.minute(), 15);
    }

    #[test]
    fn test_cancelled_and_unfilled() {
        let json = r#"{
            "ord_dt": "20260302", "ord_tmd": "091502", "odno": "1",
            "pdno": "005930", "ord_qty": "10", "tot_ccld_qty": "",
            "avg_prvs": "-", "cncl_yn": "Y"
        }"#;
        let exec: KrOrderExecution = serde_json::from_str(json).unwrap();
        let state = exec.to_order_state(Utc::now());
        assert_eq!(state.status, OrderStatus::Cancelled);
        assert_eq!(state.filled_quantity, Decimal::ZERO);
        assert_eq!(state.average_fill_price, None);
    }
}
