//! 가격과 수량 타입, 평균 체결가 계산.

use rust_decimal::Decimal;

/// 금융 정밀도를 위한 가격 타입.
pub type Price = Decimal;

/// 주문 수량을 위한 타입.
pub type Quantity = Decimal;

/// 누적 체결 수량 변화로부터 새 평균 체결가를 계산합니다.
///
/// `prev_avg`는 `prev_qty`까지의 평균이고 `fill_price`는 증가분의 체결가입니다.
pub fn blend_average_price(
    prev_avg: Option<Price>,
    prev_qty: Quantity,
    fill_qty: Quantity,
    fill_price: Price,
) -> Price {
    let total = prev_qty + fill_qty;
    if total.is_zero() {
        return fill_price;
    }
    let prev_cost = prev_avg.unwrap_or(Decimal::ZERO) * prev_qty;
    (prev_cost + fill_price * fill_qty) / total
}
