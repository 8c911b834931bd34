//! Percolator: risk-accounting engine for perpetual futures markets.
//!
//! Tracks per-account capital and PnL, accrues funding, computes margin,
//! socializes shortfalls through a global haircut ratio, executes trades
//! atomically between two accounts and liquidates undercollateralized
//! positions at the oracle price.
//!
//! Fixed point everywhere: prices carry a 1e6 scale, rates and fees are in
//! basis points. Every multi-account operation works on copies and commits
//! only after all checks pass.

#![deny(unsafe_code)]

#[cfg(kani)]
extern crate kani;

// 1. mod constants
pub mod constants {
    // Account capacity is cfg-configured so Kani works on a tiny slab.
    #[cfg(kani)]
    pub const MAX_ACCOUNTS: usize = 4;

    #[cfg(not(kani))]
    pub const MAX_ACCOUNTS: usize = 4096;

    pub const BITMAP_WORDS: usize = (MAX_ACCOUNTS + 63) / 64;

    /// 1.0 in price/funding fixed point.
    pub const PRICE_SCALE: u128 = 1_000_000;
    pub const PRICE_SCALE_I: i128 = 1_000_000;
    pub const BPS_DENOM: u128 = 10_000;
    pub const MAX_BPS: u64 = 10_000;

    pub const MAX_ORACLE_PRICE: u64 = 1_000_000_000_000_000;
    pub const MAX_POSITION_ABS: u128 = 100_000_000_000_000_000_000;

    /// Sanity bound on the funding rate (100% per slot).
    pub const MAX_FUNDING_RATE_BPS_PER_SLOT: i64 = 10_000;

    /// Slots scanned per keeper crank.
    pub const ACCOUNTS_PER_CRANK: u16 = 256;
    /// Liquidations attempted per keeper crank.
    pub const LIQ_BUDGET_PER_CRANK: u16 = 120;

    pub const NO_FREE_SLOT: u16 = u16::MAX;

    /// flags(4) + reserved(4) + exec_price(8) + exec_size(16)
    pub const MATCH_RESULT_LEN: usize = 32;
    /// 4 x u64 + 2 x u128 + u64 + u128
    pub const RISK_PARAMS_LEN: usize = 88;
}

// 2. mod error
pub mod error {
    use num_derive::{FromPrimitive, ToPrimitive};
    use thiserror::Error;

    #[repr(u32)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Error, FromPrimitive, ToPrimitive)]
    pub enum RiskError {
        #[error("arithmetic overflow")]
        Overflow,
        #[error("arithmetic underflow")]
        Underflow,
        #[error("matcher output failed validation")]
        InvalidMatcherOutput,
        #[error("equity at or below maintenance margin")]
        InsufficientMargin,
        #[error("equity below initial margin for a risk-increasing trade")]
        InsufficientInitialMargin,
        #[error("account is above maintenance margin")]
        NotLiquidatable,
        #[error("oracle price outside [1, MAX_ORACLE_PRICE]")]
        InvalidOraclePrice,
        #[error("account not found")]
        AccountNotFound,
        #[error("insufficient balance")]
        InsufficientBalance,
        #[error("account kind does not allow this operation")]
        AccountKindMismatch,
        #[error("account still has an open position")]
        AccountNotFlat,
        #[error("account slab is full")]
        SlabFull,
        #[error("invalid risk parameters")]
        InvalidRiskParams,
        #[error("trade size must be non-zero")]
        InvalidTradeSize,
    }

    impl RiskError {
        /// Stable numeric code, suitable for a host program's custom error space.
        pub fn code(self) -> u32 {
            self as u32
        }

        pub fn from_code(code: u32) -> Option<Self> {
            num_traits::FromPrimitive::from_u32(code)
        }

        /// `NotLiquidatable` means "nothing to do", not a failure.
        pub fn is_skip(self) -> bool {
            matches!(self, RiskError::NotLiquidatable)
        }
    }

    pub type Result<T> = core::result::Result<T, RiskError>;
}

// 3. mod math
pub mod math {
    use crate::constants::{BPS_DENOM, MAX_ORACLE_PRICE, PRICE_SCALE};
    use crate::error::{Result, RiskError};

    #[inline]
    pub fn clamp_pos_i128(val: i128) -> u128 {
        if val > 0 {
            val as u128
        } else {
            0
        }
    }

    #[inline]
    pub fn u128_to_i128(x: u128) -> Result<i128> {
        i128::try_from(x).map_err(|_| RiskError::Overflow)
    }

    /// Clamps values above `i128::MAX` instead of wrapping negative.
    #[inline]
    pub fn u128_to_i128_clamped(x: u128) -> i128 {
        if x > i128::MAX as u128 {
            i128::MAX
        } else {
            x as i128
        }
    }

    #[inline]
    pub fn validate_oracle_price(price: u64) -> Result<()> {
        if price == 0 || price > MAX_ORACLE_PRICE {
            return Err(RiskError::InvalidOraclePrice);
        }
        Ok(())
    }

    /// `|size| * price / 1e6`, floored.
    #[inline]
    pub fn notional(size: i128, price: u64) -> Result<u128> {
        let gross = size
            .unsigned_abs()
            .checked_mul(price as u128)
            .ok_or(RiskError::Overflow)?;
        Ok(gross / PRICE_SCALE)
    }

    /// `ceil(amount * bps / 10_000)`. Fees and margin requirements round up.
    #[inline]
    pub fn mul_bps_ceil(amount: u128, bps: u64) -> Result<u128> {
        let scaled = amount
            .checked_mul(bps as u128)
            .ok_or(RiskError::Overflow)?
            .checked_add(BPS_DENOM - 1)
            .ok_or(RiskError::Overflow)?;
        Ok(scaled / BPS_DENOM)
    }

    /// `floor(amount * num / den)` for a ratio `num <= den`.
    ///
    /// Never panics. If the direct product overflows, falls back to a split
    /// computation that can only under-estimate.
    pub fn mul_div_floor(amount: u128, num: u128, den: u128) -> u128 {
        if den == 0 || num >= den {
            return amount;
        }
        if let Some(p) = amount.checked_mul(num) {
            return p / den;
        }
        let q = amount / den;
        let r = amount % den;
        let head = q * num;
        let tail = match r.checked_mul(num) {
            Some(p) => p / den,
            None => {
                let step = den / num + u128::from(den % num != 0);
                r / step
            }
        };
        head.saturating_add(tail)
    }
}

// 4. mod params
pub mod params {
    use crate::constants::{MAX_ACCOUNTS, MAX_BPS};
    use crate::error::{Result, RiskError};

    /// Per-market risk configuration.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct RiskParams {
        /// Maintenance margin ratio in basis points (e.g. 500 = 5%)
        pub maintenance_margin_bps: u64,

        /// Initial margin ratio in basis points, required on risk-increasing trades
        pub initial_margin_bps: u64,

        /// Trading fee in basis points, charged to the taker's capital
        pub trading_fee_bps: u64,

        /// Maximum number of live accounts (at most `MAX_ACCOUNTS`)
        pub max_accounts: u64,

        /// Flat account creation fee, paid into the insurance fund
        pub new_account_fee: u128,

        /// Maintenance fee per account per slot (capital units)
        pub maintenance_fee_per_slot: u128,

        /// Liquidation fee in basis points of the closed notional
        pub liquidation_fee_bps: u64,

        /// Absolute cap on a single liquidation fee; zero disables the cap
        pub liquidation_fee_cap: u128,
    }

    impl RiskParams {
        pub fn validate(&self) -> Result<()> {
            if self.maintenance_margin_bps > MAX_BPS
                || self.initial_margin_bps > MAX_BPS
                || self.initial_margin_bps < self.maintenance_margin_bps
                || self.trading_fee_bps > MAX_BPS
                || self.liquidation_fee_bps > MAX_BPS
            {
                return Err(RiskError::InvalidRiskParams);
            }
            if self.max_accounts == 0 || self.max_accounts > MAX_ACCOUNTS as u64 {
                return Err(RiskError::InvalidRiskParams);
            }
            Ok(())
        }

        /// Applies `liquidation_fee_cap` (zero = uncapped).
        pub fn cap_liquidation_fee(&self, fee: u128) -> u128 {
            if self.liquidation_fee_cap == 0 {
                fee
            } else {
                fee.min(self.liquidation_fee_cap)
            }
        }
    }
}

// 5. mod state
pub mod state {
    use bytemuck::{Pod, Zeroable};
    use num_derive::FromPrimitive;

    use crate::constants::MAX_POSITION_ABS;
    use crate::error::{Result, RiskError};
    use crate::math::clamp_pos_i128;

    #[repr(u8)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive)]
    pub enum AccountKind {
        User = 0,
        /// Liquidity provider quoting through an external matcher.
        Lp = 1,
        /// Passive pool counterparty; not margin-checked on trades.
        Pool = 2,
    }

    /// Per-participant ledger entry.
    ///
    /// Plain-old-data so the serialized form is exactly `bytemuck::bytes_of`.
    #[repr(C)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
    pub struct TradingAccount {
        /// Protected principal, senior claim. Never haircut.
        pub capital: u128,

        /// Settled PnL. Junior claim when positive.
        pub realized_pnl: i128,

        /// Signed base units (+long / -short).
        pub position_size: i128,

        /// Global funding index as of the last settlement.
        pub funding_snapshot: i128,

        /// Prepaid fee credit; negative means fee debt.
        pub fee_credits: i128,

        /// Never recycled, even when the slot is.
        pub account_id: u64,

        /// Last mark price (variation margin reference), not an average entry.
        pub entry_price: u64,

        pub last_fee_slot: u64,

        /// Matcher program and context for LP accounts, zero otherwise.
        pub matcher_program: [u8; 32],
        pub matcher_context: [u8; 32],

        pub kind: u8,
        pub _padding: [u8; 7],
    }

    impl TradingAccount {
        pub fn new(kind: AccountKind, account_id: u64) -> Self {
            TradingAccount {
                account_id,
                kind: kind as u8,
                ..Self::zeroed()
            }
        }

        pub fn kind(&self) -> Option<AccountKind> {
            num_traits::FromPrimitive::from_u8(self.kind)
        }

        pub fn is_user(&self) -> bool {
            self.kind() == Some(AccountKind::User)
        }

        pub fn is_lp(&self) -> bool {
            self.kind() == Some(AccountKind::Lp)
        }

        pub fn is_pool(&self) -> bool {
            self.kind() == Some(AccountKind::Pool)
        }

        pub fn is_flat(&self) -> bool {
            self.position_size == 0
        }

        pub fn fee_debt(&self) -> u128 {
            if self.fee_credits < 0 {
                self.fee_credits.unsigned_abs()
            } else {
                0
            }
        }
    }

    /// Global funding index, one per market.
    #[repr(C)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
    pub struct FundingState {
        /// Cumulative funding, quote per base unit at 1e6 scale.
        pub funding_index: i128,
        pub last_funding_slot: u64,
        /// Rate in effect since `last_funding_slot`.
        pub funding_rate_bps_per_slot: i64,
    }

    impl FundingState {
        pub fn new(start_slot: u64) -> Self {
            FundingState {
                funding_index: 0,
                last_funding_slot: start_slot,
                funding_rate_bps_per_slot: 0,
            }
        }
    }

    /// Market-wide aggregates. Only ever changed alongside the account
    /// mutation it aggregates, through the setters below.
    #[repr(C)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
    pub struct GlobalState {
        /// Collateral actually held.
        pub vault_balance: u128,
        /// Sum of capital over all accounts.
        pub capital_total: u128,
        /// Sum of max(realized_pnl, 0) over all accounts.
        pub pnl_positive_total: u128,
        pub insurance_fund: u128,
        /// Lifetime fees booked into the insurance fund.
        pub fee_revenue: u128,
        /// Sum of |position_size| over all accounts.
        pub total_open_interest: u128,
        pub lifetime_liquidations: u64,
        pub _reserved: u64,
    }

    impl GlobalState {
        pub fn new() -> Self {
            Self::zeroed()
        }

        /// `max(0, vault - capital_total - insurance_fund)`: what is left to
        /// back positive PnL.
        pub fn residual(&self) -> u128 {
            self.vault_balance
                .saturating_sub(self.capital_total)
                .saturating_sub(self.insurance_fund)
        }

        pub fn set_capital(&mut self, account: &mut TradingAccount, new_capital: u128) -> Result<()> {
            let old = account.capital;
            let total = if new_capital >= old {
                self.capital_total
                    .checked_add(new_capital - old)
                    .ok_or(RiskError::Overflow)?
            } else {
                self.capital_total
                    .checked_sub(old - new_capital)
                    .ok_or(RiskError::Underflow)?
            };
            self.capital_total = total;
            account.capital = new_capital;
            Ok(())
        }

        pub fn credit_capital(&mut self, account: &mut TradingAccount, amount: u128) -> Result<()> {
            let new_capital = account
                .capital
                .checked_add(amount)
                .ok_or(RiskError::Overflow)?;
            self.set_capital(account, new_capital)
        }

        pub fn debit_capital(&mut self, account: &mut TradingAccount, amount: u128) -> Result<()> {
            let new_capital = account
                .capital
                .checked_sub(amount)
                .ok_or(RiskError::Underflow)?;
            self.set_capital(account, new_capital)
        }

        pub fn set_pnl(&mut self, account: &mut TradingAccount, new_pnl: i128) -> Result<()> {
            let old_pos = clamp_pos_i128(account.realized_pnl);
            let new_pos = clamp_pos_i128(new_pnl);
            let total = self
                .pnl_positive_total
                .checked_sub(old_pos)
                .ok_or(RiskError::Underflow)?
                .checked_add(new_pos)
                .ok_or(RiskError::Overflow)?;
            self.pnl_positive_total = total;
            account.realized_pnl = new_pnl;
            Ok(())
        }

        pub fn add_pnl(&mut self, account: &mut TradingAccount, delta: i128) -> Result<()> {
            let new_pnl = account
                .realized_pnl
                .checked_add(delta)
                .ok_or(RiskError::Overflow)?;
            self.set_pnl(account, new_pnl)
        }

        /// Sets the position, enforcing `MAX_POSITION_ABS` and keeping open
        /// interest in step.
        pub fn set_position(&mut self, account: &mut TradingAccount, new_position: i128) -> Result<()> {
            let new_abs = new_position.unsigned_abs();
            if new_abs > MAX_POSITION_ABS {
                return Err(RiskError::Overflow);
            }
            let old_abs = account.position_size.unsigned_abs();
            let oi = if new_abs >= old_abs {
                self.total_open_interest
                    .checked_add(new_abs - old_abs)
                    .ok_or(RiskError::Overflow)?
            } else {
                self.total_open_interest
                    .checked_sub(old_abs - new_abs)
                    .ok_or(RiskError::Underflow)?
            };
            self.total_open_interest = oi;
            account.position_size = new_position;
            Ok(())
        }

        /// Books a fee into the insurance fund. The tokens are already in the
        /// vault, so the vault balance is unchanged.
        pub fn book_fee(&mut self, amount: u128) -> Result<()> {
            self.insurance_fund = self
                .insurance_fund
                .checked_add(amount)
                .ok_or(RiskError::Overflow)?;
            self.fee_revenue = self
                .fee_revenue
                .checked_add(amount)
                .ok_or(RiskError::Overflow)?;
            Ok(())
        }
    }

    impl Default for GlobalState {
        fn default() -> Self {
            Self::new()
        }
    }
}

// 6. mod ledger
pub mod ledger {
    use tracing::warn;

    use crate::error::{Result, RiskError};
    use crate::margin::calculate_mark_pnl;
    use crate::math::u128_to_i128;
    use crate::params::RiskParams;
    use crate::state::{GlobalState, TradingAccount};

    /// Tokens in: vault and capital grow together.
    pub fn deposit_capital(account: &mut TradingAccount, global: &mut GlobalState, amount: u128) -> Result<()> {
        global.vault_balance = global
            .vault_balance
            .checked_add(amount)
            .ok_or(RiskError::Overflow)?;
        global.credit_capital(account, amount)
    }

    /// Tokens out: capital and vault shrink together.
    pub fn withdraw_capital(account: &mut TradingAccount, global: &mut GlobalState, amount: u128) -> Result<()> {
        if amount > account.capital {
            return Err(RiskError::InsufficientBalance);
        }
        global.debit_capital(account, amount)?;
        global.vault_balance = global
            .vault_balance
            .checked_sub(amount)
            .ok_or(RiskError::Underflow)?;
        Ok(())
    }

    /// Realizes mark PnL at `oracle_price` and re-marks the entry price.
    /// Afterwards the account has no unrealized PnL at this price.
    pub fn settle_mark_to_oracle(
        account: &mut TradingAccount,
        oracle_price: u64,
        global: &mut GlobalState,
    ) -> Result<i128> {
        if account.position_size == 0 {
            account.entry_price = oracle_price;
            return Ok(0);
        }
        let mark = calculate_mark_pnl(account.position_size, account.entry_price, oracle_price)?;
        global.add_pnl(account, mark)?;
        account.entry_price = oracle_price;
        Ok(mark)
    }

    /// Pays negative PnL out of capital. Whatever capital cannot cover is
    /// written off; the shortfall then shows up in the haircut ratio.
    ///
    /// Returns the amount written off.
    pub fn settle_losses(account: &mut TradingAccount, global: &mut GlobalState) -> Result<u128> {
        let pnl = account.realized_pnl;
        if pnl >= 0 {
            return Ok(0);
        }
        let pay = pnl.unsigned_abs().min(account.capital);
        if pay > 0 {
            global.debit_capital(account, pay)?;
            global.add_pnl(account, u128_to_i128(pay)?)?;
        }
        let remaining = account.realized_pnl;
        if remaining < 0 {
            let written_off = remaining.unsigned_abs();
            global.set_pnl(account, 0)?;
            warn!(
                account_id = account.account_id,
                written_off,
                "loss exceeds capital, writing off"
            );
            return Ok(written_off);
        }
        Ok(0)
    }

    /// Sweeps fee debt (negative `fee_credits`) out of available capital into
    /// the insurance fund.
    pub fn pay_fee_debt_from_capital(account: &mut TradingAccount, global: &mut GlobalState) -> Result<u128> {
        if account.fee_credits >= 0 || account.capital == 0 {
            return Ok(0);
        }
        let pay = account.fee_debt().min(account.capital);
        global.debit_capital(account, pay)?;
        global.book_fee(pay)?;
        account.fee_credits = account
            .fee_credits
            .checked_add(u128_to_i128(pay)?)
            .ok_or(RiskError::Overflow)?;
        Ok(pay)
    }

    /// Charges maintenance fees accrued since `last_fee_slot`.
    ///
    /// Fees consume `fee_credits` first; any debt is paid from capital as far
    /// as capital allows and the rest stays on the account as fee debt.
    pub fn settle_maintenance_fee(
        account: &mut TradingAccount,
        now_slot: u64,
        params: &RiskParams,
        global: &mut GlobalState,
    ) -> Result<u128> {
        let dt = now_slot.saturating_sub(account.last_fee_slot);
        if dt == 0 {
            return Ok(0);
        }
        account.last_fee_slot = now_slot;
        if params.maintenance_fee_per_slot == 0 {
            return Ok(0);
        }
        let due = params
            .maintenance_fee_per_slot
            .checked_mul(dt as u128)
            .ok_or(RiskError::Overflow)?;
        account.fee_credits = account
            .fee_credits
            .checked_sub(u128_to_i128(due)?)
            .ok_or(RiskError::Underflow)?;
        pay_fee_debt_from_capital(account, global)
    }
}

// 7. mod funding
pub mod funding {
    use tracing::debug;

    use crate::constants::{MAX_FUNDING_RATE_BPS_PER_SLOT, PRICE_SCALE_I};
    use crate::error::{Result, RiskError};
    use crate::math::validate_oracle_price;
    use crate::state::{FundingState, GlobalState, TradingAccount};

    /// Accrues the global funding index up to `current_slot` using the rate
    /// stored in `state`.
    ///
    /// `ΔF = price × rate × dt / 10_000`. A stale or repeated slot is a no-op.
    pub fn accrue_funding(state: &mut FundingState, current_slot: u64, price_sample: u64) -> Result<()> {
        let dt = current_slot.saturating_sub(state.last_funding_slot);
        if dt == 0 {
            return Ok(());
        }
        validate_oracle_price(price_sample)?;
        let rate = state.funding_rate_bps_per_slot;
        if rate.unsigned_abs() > MAX_FUNDING_RATE_BPS_PER_SLOT as u64 {
            return Err(RiskError::Overflow);
        }

        let delta = (price_sample as i128)
            .checked_mul(rate as i128)
            .ok_or(RiskError::Overflow)?
            .checked_mul(dt as i128)
            .ok_or(RiskError::Overflow)?
            / 10_000;

        let index = state
            .funding_index
            .checked_add(delta)
            .ok_or(RiskError::Overflow)?;

        state.funding_index = index;
        state.last_funding_slot = current_slot;
        debug!(dt, rate, delta, index, "funding accrued");
        Ok(())
    }

    /// Installs the rate for the interval starting at `last_funding_slot`.
    ///
    /// Call after `accrue_funding` so the elapsed interval was charged at the
    /// old rate.
    pub fn set_funding_rate_for_next_interval(state: &mut FundingState, rate_bps_per_slot: i64) -> Result<()> {
        if rate_bps_per_slot.unsigned_abs() > MAX_FUNDING_RATE_BPS_PER_SLOT as u64 {
            return Err(RiskError::Overflow);
        }
        state.funding_rate_bps_per_slot = rate_bps_per_slot;
        Ok(())
    }

    /// Accrues the elapsed interval at the stored rate, then installs
    /// `next_rate_bps_per_slot` for the following one. All or nothing.
    pub fn accrue_funding_with_rate(
        state: &mut FundingState,
        current_slot: u64,
        price_sample: u64,
        next_rate_bps_per_slot: i64,
    ) -> Result<()> {
        let mut next = *state;
        accrue_funding(&mut next, current_slot, price_sample)?;
        set_funding_rate_for_next_interval(&mut next, next_rate_bps_per_slot)?;
        *state = next;
        Ok(())
    }

    /// Funding owed by `account` since its snapshot. Positive means the
    /// account pays.
    ///
    /// Rounded up when paying and truncated when receiving, so the vault
    /// never owes more than it collected.
    pub fn pending_funding_payment(account: &TradingAccount, state: &FundingState) -> Result<i128> {
        let delta_f = state
            .funding_index
            .checked_sub(account.funding_snapshot)
            .ok_or(RiskError::Overflow)?;
        if delta_f == 0 || account.position_size == 0 {
            return Ok(0);
        }
        let raw = account
            .position_size
            .checked_mul(delta_f)
            .ok_or(RiskError::Overflow)?;
        if raw > 0 {
            Ok(raw
                .checked_add(PRICE_SCALE_I - 1)
                .ok_or(RiskError::Overflow)?
                / PRICE_SCALE_I)
        } else {
            Ok(raw / PRICE_SCALE_I)
        }
    }

    /// Settles funding into `realized_pnl` and advances the snapshot.
    ///
    /// Longs pay when the index rose; shorts receive. Must run before anything
    /// reads `realized_pnl` for haircut or margin purposes.
    pub fn settle_funding_for_account(
        account: &mut TradingAccount,
        state: &FundingState,
        global: &mut GlobalState,
    ) -> Result<i128> {
        let payment = pending_funding_payment(account, state)?;
        if payment != 0 {
            let new_pnl = account
                .realized_pnl
                .checked_sub(payment)
                .ok_or(RiskError::Overflow)?;
            global.set_pnl(account, new_pnl)?;
        }
        account.funding_snapshot = state.funding_index;
        Ok(payment)
    }
}

// 8. mod margin
pub mod margin {
    use crate::constants::PRICE_SCALE_I;
    use crate::error::{Result, RiskError};
    use crate::math::{clamp_pos_i128, mul_bps_ceil, mul_div_floor, notional, u128_to_i128_clamped};
    use crate::state::TradingAccount;

    /// `position × (mark − entry) / 1e6`, truncated toward zero.
    ///
    /// Truncation is symmetric, so equal and opposite positions mark to
    /// exactly opposite PnL.
    pub fn calculate_mark_pnl(position_size: i128, entry_price: u64, mark_price: u64) -> Result<i128> {
        if position_size == 0 {
            return Ok(0);
        }
        let diff = (mark_price as i128) - (entry_price as i128);
        let gross = position_size.checked_mul(diff).ok_or(RiskError::Overflow)?;
        Ok(gross / PRICE_SCALE_I)
    }

    /// Equity for margin purposes:
    /// `max(0, capital + haircut(realized_pnl) + mark_pnl)`.
    ///
    /// Only positive realized PnL is scaled by the haircut; principal and
    /// losses pass through untouched. Never panics: a mark term too large to
    /// represent counts as zero when in profit and zeroes equity when in loss.
    pub fn calculate_margin_equity(account: &TradingAccount, mark_price: u64, haircut_ratio: (u128, u128)) -> u128 {
        let losing = (account.position_size > 0) == (mark_price < account.entry_price);
        let mark_pnl = match calculate_mark_pnl(account.position_size, account.entry_price, mark_price) {
            Ok(v) => v,
            Err(_) if losing => return 0,
            Err(_) => 0,
        };

        let (num, den) = haircut_ratio;
        let effective_pnl = if account.realized_pnl > 0 {
            u128_to_i128_clamped(mul_div_floor(account.realized_pnl as u128, num, den))
        } else {
            account.realized_pnl
        };

        let equity = u128_to_i128_clamped(account.capital)
            .saturating_add(effective_pnl)
            .saturating_add(mark_pnl);
        clamp_pos_i128(equity)
    }

    /// `|new| > |old|`, or the position flips side (a close plus an open).
    pub fn is_risk_increasing(old_pos: i128, new_pos: i128) -> bool {
        let flips = (old_pos > 0 && new_pos < 0) || (old_pos < 0 && new_pos > 0);
        new_pos.unsigned_abs() > old_pos.unsigned_abs() || flips
    }

    /// Maintenance requirement at `mark_price`, rounded up.
    pub fn maintenance_requirement(account: &TradingAccount, mark_price: u64, maintenance_bps: u64) -> Result<u128> {
        mul_bps_ceil(notional(account.position_size, mark_price)?, maintenance_bps)
    }

    /// Fails with `InsufficientMargin` when `equity <= mm_required`, and for
    /// risk-increasing trades also with `InsufficientInitialMargin` when
    /// `equity < im_required`. Outstanding fee debt counts against equity.
    /// A flat account carries no requirement.
    pub fn check_margin_requirements(
        account: &TradingAccount,
        mark_price: u64,
        haircut_ratio: (u128, u128),
        maintenance_bps: u64,
        initial_bps: u64,
        is_risk_increasing: bool,
    ) -> Result<()> {
        if account.position_size == 0 {
            return Ok(());
        }
        let equity = calculate_margin_equity(account, mark_price, haircut_ratio).saturating_sub(account.fee_debt());
        let notional = notional(account.position_size, mark_price)?;

        let mm_required = mul_bps_ceil(notional, maintenance_bps)?;
        if equity <= mm_required {
            return Err(RiskError::InsufficientMargin);
        }
        if is_risk_increasing {
            let im_required = mul_bps_ceil(notional, initial_bps)?;
            if equity < im_required {
                return Err(RiskError::InsufficientInitialMargin);
            }
        }
        Ok(())
    }
}

// 9. mod haircut
pub mod haircut {
    use tracing::debug;

    use crate::error::Result;
    use crate::math::mul_div_floor;
    use crate::state::{GlobalState, TradingAccount};

    /// `h = min(residual, pnl_positive_total) / pnl_positive_total`, with
    /// `(1, 1)` when nobody holds positive PnL. Always within `[0, 1]`.
    pub fn get_haircut_ratio(global: &GlobalState) -> (u128, u128) {
        let pnl_pos_tot = global.pnl_positive_total;
        if pnl_pos_tot == 0 {
            return (1, 1);
        }
        (global.residual().min(pnl_pos_tot), pnl_pos_tot)
    }

    /// `floor(max(pnl, 0) × h)`.
    pub fn effective_positive_pnl(pnl: i128, haircut_ratio: (u128, u128)) -> u128 {
        if pnl <= 0 {
            return 0;
        }
        mul_div_floor(pnl as u128, haircut_ratio.0, haircut_ratio.1)
    }

    /// Converts the positive PnL of a flat account into capital at the
    /// current haircut. The ratio seen by every other account is unchanged.
    ///
    /// Returns the capital credited.
    pub fn settle_profit_to_capital(account: &mut TradingAccount, global: &mut GlobalState) -> Result<u128> {
        if account.position_size != 0 || account.realized_pnl <= 0 {
            return Ok(0);
        }
        let claim = account.realized_pnl as u128;
        let ratio = get_haircut_ratio(global);
        let paid = effective_positive_pnl(account.realized_pnl, ratio);

        global.set_pnl(account, 0)?;
        global.credit_capital(account, paid)?;
        if paid < claim {
            debug!(
                account_id = account.account_id,
                claim,
                paid,
                "profit converted under haircut"
            );
        }
        Ok(paid)
    }
}

// 10. mod matcher
pub mod matcher {
    use crate::constants::{MAX_ORACLE_PRICE, MAX_POSITION_ABS};
    use crate::error::{Result, RiskError};
    use crate::wire;

    /// Response is well formed.
    pub const FLAG_VALID: u32 = 1;
    /// Partial fills down to zero are acceptable to the caller.
    pub const FLAG_PARTIAL_OK: u32 = 2;
    /// The matcher declined the trade.
    pub const FLAG_REJECTED: u32 = 4;

    /// Raw matcher output. Untrusted until `validate_match_result` accepts it.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct MatchResult {
        pub flags: u32,
        pub exec_price: u64,
        pub exec_size: i128,
    }

    impl MatchResult {
        pub fn filled(exec_price: u64, exec_size: i128) -> Self {
            MatchResult {
                flags: FLAG_VALID,
                exec_price,
                exec_size,
            }
        }
    }

    /// A fill that passed the trust boundary. Only `validate_match_result`
    /// constructs one.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct ValidatedFill {
        exec_price: u64,
        exec_size: i128,
    }

    impl ValidatedFill {
        pub fn exec_price(&self) -> u64 {
            self.exec_price
        }

        pub fn exec_size(&self) -> i128 {
            self.exec_size
        }
    }

    /// External order matching (CLOB, AMM, RFQ...). Implementations are
    /// untrusted; the engine validates every result.
    pub trait MatchingEngine {
        fn execute_match(
            &self,
            lp_program: &[u8; 32],
            lp_context: &[u8; 32],
            lp_account_id: u64,
            oracle_price: u64,
            size: i128,
        ) -> Result<MatchResult>;
    }

    /// Fills the full request at the oracle price.
    pub struct NoOpMatcher;

    impl MatchingEngine for NoOpMatcher {
        fn execute_match(
            &self,
            _lp_program: &[u8; 32],
            _lp_context: &[u8; 32],
            _lp_account_id: u64,
            oracle_price: u64,
            size: i128,
        ) -> Result<MatchResult> {
            Ok(MatchResult::filled(oracle_price, size))
        }
    }

    /// Reads the result an external matcher program wrote into its context
    /// buffer.
    pub struct ContextMatcher<'a> {
        pub ctx: &'a [u8],
    }

    impl MatchingEngine for ContextMatcher<'_> {
        fn execute_match(
            &self,
            _lp_program: &[u8; 32],
            _lp_context: &[u8; 32],
            _lp_account_id: u64,
            _oracle_price: u64,
            _size: i128,
        ) -> Result<MatchResult> {
            wire::read_match_result(self.ctx)
        }
    }

    /// Trust-boundary check on matcher output.
    ///
    /// Returns `Ok(None)` for an accepted zero fill, which must leave the
    /// ledger untouched.
    pub fn validate_match_result(result: &MatchResult, requested_size: i128) -> Result<Option<ValidatedFill>> {
        if result.flags & FLAG_VALID == 0 || result.flags & FLAG_REJECTED != 0 {
            return Err(RiskError::InvalidMatcherOutput);
        }
        if result.exec_price == 0 || result.exec_price > MAX_ORACLE_PRICE {
            return Err(RiskError::InvalidMatcherOutput);
        }
        if result.exec_size == 0 {
            if result.flags & FLAG_PARTIAL_OK == 0 {
                return Err(RiskError::InvalidMatcherOutput);
            }
            return Ok(None);
        }
        // unsigned_abs keeps i128::MIN out of the overflow path
        let exec_abs = result.exec_size.unsigned_abs();
        if exec_abs > requested_size.unsigned_abs() || exec_abs > MAX_POSITION_ABS {
            return Err(RiskError::InvalidMatcherOutput);
        }
        if result.exec_size.signum() != requested_size.signum() {
            return Err(RiskError::InvalidMatcherOutput);
        }
        Ok(Some(ValidatedFill {
            exec_price: result.exec_price,
            exec_size: result.exec_size,
        }))
    }
}

// 11. mod wire (arrayref island)
#[allow(unsafe_code)] // arrayref macros expand to unchecked slice-to-array casts
pub mod wire {
    use arrayref::{array_ref, array_refs, mut_array_refs};

    use crate::constants::{MATCH_RESULT_LEN, RISK_PARAMS_LEN};
    use crate::error::{Result, RiskError};
    use crate::matcher::MatchResult;
    use crate::params::RiskParams;

    /// Decodes and validates market parameters (little endian).
    pub fn read_risk_params(input: &[u8]) -> Result<RiskParams> {
        if input.len() < RISK_PARAMS_LEN {
            return Err(RiskError::InvalidRiskParams);
        }
        let src = array_ref![input, 0, RISK_PARAMS_LEN];
        let (mm, im, trading_fee, max_accounts, new_account_fee, maintenance_fee, liq_fee, liq_cap) =
            array_refs![src, 8, 8, 8, 8, 16, 16, 8, 16];

        let params = RiskParams {
            maintenance_margin_bps: u64::from_le_bytes(*mm),
            initial_margin_bps: u64::from_le_bytes(*im),
            trading_fee_bps: u64::from_le_bytes(*trading_fee),
            max_accounts: u64::from_le_bytes(*max_accounts),
            new_account_fee: u128::from_le_bytes(*new_account_fee),
            maintenance_fee_per_slot: u128::from_le_bytes(*maintenance_fee),
            liquidation_fee_bps: u64::from_le_bytes(*liq_fee),
            liquidation_fee_cap: u128::from_le_bytes(*liq_cap),
        };
        params.validate()?;
        Ok(params)
    }

    pub fn write_risk_params(params: &RiskParams) -> [u8; RISK_PARAMS_LEN] {
        let mut out = [0u8; RISK_PARAMS_LEN];
        {
            let (mm, im, trading_fee, max_accounts, new_account_fee, maintenance_fee, liq_fee, liq_cap) =
                mut_array_refs![&mut out, 8, 8, 8, 8, 16, 16, 8, 16];
            *mm = params.maintenance_margin_bps.to_le_bytes();
            *im = params.initial_margin_bps.to_le_bytes();
            *trading_fee = params.trading_fee_bps.to_le_bytes();
            *max_accounts = params.max_accounts.to_le_bytes();
            *new_account_fee = params.new_account_fee.to_le_bytes();
            *maintenance_fee = params.maintenance_fee_per_slot.to_le_bytes();
            *liq_fee = params.liquidation_fee_bps.to_le_bytes();
            *liq_cap = params.liquidation_fee_cap.to_le_bytes();
        }
        out
    }

    /// Decodes a matcher return buffer. Structural problems (short buffer,
    /// non-zero reserved word) are matcher faults.
    pub fn read_match_result(ctx: &[u8]) -> Result<MatchResult> {
        if ctx.len() < MATCH_RESULT_LEN {
            return Err(RiskError::InvalidMatcherOutput);
        }
        let src = array_ref![ctx, 0, MATCH_RESULT_LEN];
        let (flags, reserved, exec_price, exec_size) = array_refs![src, 4, 4, 8, 16];
        if u32::from_le_bytes(*reserved) != 0 {
            return Err(RiskError::InvalidMatcherOutput);
        }
        Ok(MatchResult {
            flags: u32::from_le_bytes(*flags),
            exec_price: u64::from_le_bytes(*exec_price),
            exec_size: i128::from_le_bytes(*exec_size),
        })
    }

    pub fn write_match_result(result: &MatchResult) -> [u8; MATCH_RESULT_LEN] {
        let mut out = [0u8; MATCH_RESULT_LEN];
        {
            let (flags, _reserved, exec_price, exec_size) = mut_array_refs![&mut out, 4, 4, 8, 16];
            *flags = result.flags.to_le_bytes();
            *exec_price = result.exec_price.to_le_bytes();
            *exec_size = result.exec_size.to_le_bytes();
        }
        out
    }
}

// 12. mod trade
pub mod trade {
    use tracing::debug;

    use crate::error::{Result, RiskError};
    use crate::funding::settle_funding_for_account;
    use crate::haircut::get_haircut_ratio;
    use crate::ledger::{settle_losses, settle_mark_to_oracle};
    use crate::margin::{calculate_mark_pnl, check_margin_requirements, is_risk_increasing};
    use crate::matcher::ValidatedFill;
    use crate::math::{mul_bps_ceil, notional, u128_to_i128, validate_oracle_price};
    use crate::params::RiskParams;
    use crate::state::{FundingState, GlobalState, TradingAccount};

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct TradeOutcome {
        pub exec_price: u64,
        pub exec_size: i128,
        /// PnL credited to the user; the counterparty gets exactly the negation.
        pub trade_pnl: i128,
        pub fee: u128,
        pub user_risk_increasing: bool,
    }

    /// Settles a validated fill between `user` and `counterparty` as one unit.
    ///
    /// Works on copies of both accounts and the global aggregates; nothing is
    /// written back unless every step, including the margin checks, passed.
    pub fn execute_trade(
        user: &mut TradingAccount,
        counterparty: &mut TradingAccount,
        fill: ValidatedFill,
        oracle_price: u64,
        funding: &FundingState,
        global: &mut GlobalState,
        params: &RiskParams,
    ) -> Result<TradeOutcome> {
        validate_oracle_price(oracle_price)?;

        let mut u = *user;
        let mut c = *counterparty;
        let mut g = *global;
        let outcome = apply_trade(&mut u, &mut c, fill, oracle_price, funding, &mut g, params)?;

        *user = u;
        *counterparty = c;
        *global = g;
        debug!(
            user = user.account_id,
            counterparty = counterparty.account_id,
            exec_size = outcome.exec_size,
            exec_price = outcome.exec_price,
            fee = outcome.fee,
            "trade committed"
        );
        Ok(outcome)
    }

    fn apply_trade(
        user: &mut TradingAccount,
        counterparty: &mut TradingAccount,
        fill: ValidatedFill,
        oracle_price: u64,
        funding: &FundingState,
        g: &mut GlobalState,
        params: &RiskParams,
    ) -> Result<TradeOutcome> {
        // 1. variation margin: both sides marked to oracle
        settle_mark_to_oracle(user, oracle_price, g)?;
        settle_mark_to_oracle(counterparty, oracle_price, g)?;

        // 2. funding, then realize losses so the residual backs any profit
        // before a haircut is read
        settle_funding_for_account(user, funding, g)?;
        settle_funding_for_account(counterparty, funding, g)?;
        settle_losses(user, g)?;
        settle_losses(counterparty, g)?;

        // 3. classify
        let exec_size = fill.exec_size();
        let exec_price = fill.exec_price();
        let old_user = user.position_size;
        let old_cp = counterparty.position_size;
        let new_user = old_user.checked_add(exec_size).ok_or(RiskError::Overflow)?;
        let new_cp = old_cp.checked_sub(exec_size).ok_or(RiskError::Overflow)?;
        let user_risk_increasing = is_risk_increasing(old_user, new_user);
        let cp_risk_increasing = is_risk_increasing(old_cp, new_cp);

        // 4. positions and zero-sum trade PnL (entry is already oracle_price)
        let trade_pnl = calculate_mark_pnl(exec_size, exec_price, oracle_price)?;
        g.set_position(user, new_user)?;
        g.set_position(counterparty, new_cp)?;
        g.add_pnl(user, trade_pnl)?;
        g.add_pnl(counterparty, trade_pnl.checked_neg().ok_or(RiskError::Overflow)?)?;

        // 5. taker fee: capital -> insurance
        let fee = mul_bps_ceil(notional(exec_size, exec_price)?, params.trading_fee_bps)?;
        g.debit_capital(user, fee)?;
        g.book_fee(fee)?;
        user.fee_credits = user
            .fee_credits
            .checked_add(u128_to_i128(fee)?)
            .ok_or(RiskError::Overflow)?;

        // 6. trade-PnL losses, then margin against the post-trade haircut
        settle_losses(user, g)?;
        settle_losses(counterparty, g)?;
        let ratio = get_haircut_ratio(g);
        check_margin_requirements(
            user,
            oracle_price,
            ratio,
            params.maintenance_margin_bps,
            params.initial_margin_bps,
            user_risk_increasing,
        )?;
        if !counterparty.is_pool() {
            check_margin_requirements(
                counterparty,
                oracle_price,
                ratio,
                params.maintenance_margin_bps,
                params.initial_margin_bps,
                cp_risk_increasing,
            )?;
        }

        Ok(TradeOutcome {
            exec_price,
            exec_size,
            trade_pnl,
            fee,
            user_risk_increasing,
        })
    }
}

// 13. mod liquidation
pub mod liquidation {
    use tracing::info;

    use crate::error::{Result, RiskError};
    use crate::funding::settle_funding_for_account;
    use crate::haircut::get_haircut_ratio;
    use crate::ledger::{settle_losses, settle_mark_to_oracle};
    use crate::margin::{calculate_margin_equity, maintenance_requirement};
    use crate::math::{mul_bps_ceil, notional, validate_oracle_price};
    use crate::params::RiskParams;
    use crate::state::{FundingState, GlobalState, TradingAccount};

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct LiquidationOutcome {
        /// Position that was force-closed at the oracle price.
        pub closed_size: i128,
        pub equity_before: u128,
        pub mm_required: u128,
        /// Loss beyond capital, socialized through the haircut.
        pub loss_written_off: u128,
        /// Fee actually collected from capital.
        pub fee: u128,
        /// Half the fee, paid out to the liquidator by the host.
        pub liquidator_reward: u128,
    }

    /// Force-closes `account` at `oracle_price` if `equity <= mm_required`.
    ///
    /// `NotLiquidatable` leaves everything untouched. Only this account and
    /// the aggregates are touched; no other position is ever reduced.
    pub fn liquidate_position(
        account: &mut TradingAccount,
        oracle_price: u64,
        funding: &FundingState,
        global: &mut GlobalState,
        params: &RiskParams,
    ) -> Result<LiquidationOutcome> {
        validate_oracle_price(oracle_price)?;

        let mut a = *account;
        let mut g = *global;
        let outcome = apply_liquidation(&mut a, oracle_price, funding, &mut g, params)?;

        *account = a;
        *global = g;
        info!(
            account_id = account.account_id,
            closed_size = outcome.closed_size,
            equity = outcome.equity_before,
            mm_required = outcome.mm_required,
            fee = outcome.fee,
            "position liquidated"
        );
        Ok(outcome)
    }

    fn apply_liquidation(
        a: &mut TradingAccount,
        oracle_price: u64,
        funding: &FundingState,
        g: &mut GlobalState,
        params: &RiskParams,
    ) -> Result<LiquidationOutcome> {
        if a.position_size == 0 {
            return Err(RiskError::NotLiquidatable);
        }
        settle_mark_to_oracle(a, oracle_price, g)?;
        settle_funding_for_account(a, funding, g)?;

        let equity = calculate_margin_equity(a, oracle_price, get_haircut_ratio(g));
        let mm_required = maintenance_requirement(a, oracle_price, params.maintenance_margin_bps)?;
        if equity > mm_required {
            return Err(RiskError::NotLiquidatable);
        }

        // Mark PnL is already realized; close the whole position at oracle.
        let closed_size = a.position_size;
        let closed_notional = notional(closed_size, oracle_price)?;
        g.set_position(a, 0)?;
        a.entry_price = oracle_price;

        let loss_written_off = settle_losses(a, g)?;

        // Fee saturates at remaining capital: the account is being closed.
        let fee_due = params.cap_liquidation_fee(mul_bps_ceil(closed_notional, params.liquidation_fee_bps)?);
        let fee = fee_due.min(a.capital);
        g.debit_capital(a, fee)?;
        let liquidator_reward = fee / 2;
        g.book_fee(fee - liquidator_reward)?;
        g.vault_balance = g
            .vault_balance
            .checked_sub(liquidator_reward)
            .ok_or(RiskError::Underflow)?;
        g.lifetime_liquidations = g.lifetime_liquidations.saturating_add(1);

        Ok(LiquidationOutcome {
            closed_size,
            equity_before: equity,
            mm_required,
            loss_written_off,
            fee,
            liquidator_reward,
        })
    }
}

// 14. mod engine
pub mod engine {
    use tracing::{debug, info, warn};

    use crate::constants::{
        ACCOUNTS_PER_CRANK, BITMAP_WORDS, LIQ_BUDGET_PER_CRANK, MAX_POSITION_ABS, NO_FREE_SLOT,
    };
    use crate::error::{Result, RiskError};
    use crate::funding::{accrue_funding_with_rate, settle_funding_for_account};
    use crate::haircut::{get_haircut_ratio, settle_profit_to_capital};
    use crate::ledger::{
        deposit_capital, pay_fee_debt_from_capital, settle_losses, settle_maintenance_fee,
        settle_mark_to_oracle, withdraw_capital,
    };
    use crate::liquidation::{liquidate_position, LiquidationOutcome};
    use crate::margin::{calculate_margin_equity, check_margin_requirements};
    use crate::matcher::{validate_match_result, MatchingEngine};
    use crate::math::{clamp_pos_i128, validate_oracle_price};
    use crate::params::RiskParams;
    use crate::state::{AccountKind, FundingState, GlobalState, TradingAccount};
    use crate::trade::{self, TradeOutcome};

    /// Read-only snapshot for display and auditing.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct AccountView {
        pub account_id: u64,
        pub kind: Option<AccountKind>,
        pub capital: u128,
        pub realized_pnl: i128,
        pub position_size: i128,
        pub entry_price: u64,
        pub fee_credits: i128,
        /// Margin equity at the queried price and current haircut. Funding
        /// accrued since the last touch is not included.
        pub equity: u128,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct CrankOutcome {
        pub funding_index: i128,
        pub num_liquidations: u32,
        pub num_liq_errors: u16,
        /// Slot where the next crank resumes scanning.
        pub last_cursor: u16,
        pub sweep_complete: bool,
    }

    #[derive(Clone, Debug, Default, PartialEq, Eq)]
    pub struct BatchLiquidation {
        pub liquidated: Vec<(u16, LiquidationOutcome)>,
        pub skipped: Vec<u16>,
    }

    /// One market: funding and global state plus an arena of accounts
    /// addressed by stable `u16` index.
    ///
    /// Every mutating entry point takes `&mut self`, so mutation is serialized
    /// per market.
    #[derive(Clone, Debug, PartialEq, Eq)]
    pub struct RiskEngine {
        pub params: RiskParams,
        pub funding: FundingState,
        pub global: GlobalState,

        pub current_slot: u64,
        pub last_crank_slot: u64,
        pub crank_cursor: u16,

        /// Occupancy bitmap
        pub used: [u64; BITMAP_WORDS],
        pub num_used_accounts: u16,
        /// Monotonic, never recycled
        pub next_account_id: u64,
        pub free_head: u16,
        pub next_free: Vec<u16>,
        pub accounts: Vec<TradingAccount>,
    }

    impl RiskEngine {
        pub fn new(params: RiskParams) -> Result<Self> {
            params.validate()?;
            let capacity = params.max_accounts as usize;

            // freelist: 0 -> 1 -> ... -> capacity-1 -> NONE
            let next_free = (0..capacity)
                .map(|i| if i + 1 < capacity { (i + 1) as u16 } else { NO_FREE_SLOT })
                .collect();

            Ok(RiskEngine {
                params,
                funding: FundingState::new(0),
                global: GlobalState::new(),
                current_slot: 0,
                last_crank_slot: 0,
                crank_cursor: 0,
                used: [0; BITMAP_WORDS],
                num_used_accounts: 0,
                next_account_id: 0,
                free_head: 0,
                next_free,
                accounts: vec![TradingAccount::new(AccountKind::User, 0); capacity],
            })
        }

        pub fn capacity(&self) -> usize {
            self.accounts.len()
        }

        // ========================================
        // Slab
        // ========================================

        pub fn is_used(&self, idx: usize) -> bool {
            if idx >= self.capacity() {
                return false;
            }
            (self.used[idx >> 6] >> (idx & 63)) & 1 == 1
        }

        fn set_used(&mut self, idx: usize) {
            self.used[idx >> 6] |= 1u64 << (idx & 63);
        }

        fn clear_used(&mut self, idx: usize) {
            self.used[idx >> 6] &= !(1u64 << (idx & 63));
        }

        /// Indices of live accounts, ascending.
        pub fn used_indices(&self) -> impl Iterator<Item = u16> + '_ {
            self.used.iter().enumerate().flat_map(|(block, &word)| {
                let mut w = word;
                core::iter::from_fn(move || {
                    if w == 0 {
                        return None;
                    }
                    let bit = w.trailing_zeros() as usize;
                    w &= w - 1;
                    Some((block * 64 + bit) as u16)
                })
            })
        }

        fn alloc_slot(&mut self) -> Result<u16> {
            if self.free_head == NO_FREE_SLOT {
                return Err(RiskError::SlabFull);
            }
            let idx = self.free_head;
            self.free_head = self.next_free[idx as usize];
            self.set_used(idx as usize);
            self.num_used_accounts += 1;
            Ok(idx)
        }

        fn free_slot(&mut self, idx: u16) {
            self.accounts[idx as usize] = TradingAccount::new(AccountKind::User, 0);
            self.clear_used(idx as usize);
            self.next_free[idx as usize] = self.free_head;
            self.free_head = idx;
            self.num_used_accounts = self.num_used_accounts.saturating_sub(1);
        }

        fn require_used(&self, idx: u16) -> Result<()> {
            if !self.is_used(idx as usize) {
                return Err(RiskError::AccountNotFound);
            }
            Ok(())
        }

        pub fn account(&self, idx: u16) -> Result<&TradingAccount> {
            self.require_used(idx)?;
            Ok(&self.accounts[idx as usize])
        }

        // ========================================
        // Account creation
        // ========================================

        pub fn add_user(&mut self, fee_payment: u128) -> Result<u16> {
            self.add_account(AccountKind::User, [0; 32], [0; 32], fee_payment)
        }

        pub fn add_lp(
            &mut self,
            matcher_program: [u8; 32],
            matcher_context: [u8; 32],
            fee_payment: u128,
        ) -> Result<u16> {
            self.add_account(AccountKind::Lp, matcher_program, matcher_context, fee_payment)
        }

        pub fn add_pool(&mut self, fee_payment: u128) -> Result<u16> {
            self.add_account(AccountKind::Pool, [0; 32], [0; 32], fee_payment)
        }

        /// Creation fee goes to insurance; any excess becomes capital.
        fn add_account(
            &mut self,
            kind: AccountKind,
            matcher_program: [u8; 32],
            matcher_context: [u8; 32],
            fee_payment: u128,
        ) -> Result<u16> {
            if self.num_used_accounts as u64 >= self.params.max_accounts {
                return Err(RiskError::SlabFull);
            }
            if fee_payment < self.params.new_account_fee {
                return Err(RiskError::InsufficientBalance);
            }

            let mut account = TradingAccount::new(kind, self.next_account_id);
            account.matcher_program = matcher_program;
            account.matcher_context = matcher_context;
            account.funding_snapshot = self.funding.funding_index;
            account.last_fee_slot = self.current_slot;

            let mut g = self.global;
            deposit_capital(&mut account, &mut g, fee_payment)?;
            g.debit_capital(&mut account, self.params.new_account_fee)?;
            g.book_fee(self.params.new_account_fee)?;

            let idx = self.alloc_slot()?;
            self.accounts[idx as usize] = account;
            self.global = g;
            self.next_account_id += 1;
            debug!(idx, account_id = account.account_id, ?kind, "account opened");
            Ok(idx)
        }

        // ========================================
        // Deposits and withdrawals
        // ========================================

        /// Deposit collateral. Outstanding fee debt is paid from it first.
        pub fn deposit(&mut self, idx: u16, amount: u128, now_slot: u64) -> Result<()> {
            self.require_used(idx)?;
            let mut a = self.accounts[idx as usize];
            let mut g = self.global;

            deposit_capital(&mut a, &mut g, amount)?;
            settle_maintenance_fee(&mut a, now_slot, &self.params, &mut g)?;
            pay_fee_debt_from_capital(&mut a, &mut g)?;
            settle_losses(&mut a, &mut g)?;

            self.accounts[idx as usize] = a;
            self.global = g;
            self.current_slot = self.current_slot.max(now_slot);
            Ok(())
        }

        /// Withdraw capital. With an open position the account must still pass
        /// the maintenance check afterwards.
        pub fn withdraw(&mut self, idx: u16, amount: u128, now_slot: u64, oracle_price: u64) -> Result<()> {
            self.require_used(idx)?;
            validate_oracle_price(oracle_price)?;
            let mut a = self.accounts[idx as usize];
            let mut g = self.global;

            touch(&mut a, &mut g, &self.funding, &self.params, now_slot, oracle_price)?;
            withdraw_capital(&mut a, &mut g, amount)?;
            check_margin_requirements(
                &a,
                oracle_price,
                get_haircut_ratio(&g),
                self.params.maintenance_margin_bps,
                self.params.initial_margin_bps,
                false,
            )?;

            self.accounts[idx as usize] = a;
            self.global = g;
            self.current_slot = self.current_slot.max(now_slot);
            Ok(())
        }

        /// Lazy settlement: mark, funding, maintenance fees, losses and (for
        /// flat accounts) profit conversion.
        pub fn touch_account(&mut self, idx: u16, now_slot: u64, oracle_price: u64) -> Result<()> {
            self.require_used(idx)?;
            validate_oracle_price(oracle_price)?;
            let mut a = self.accounts[idx as usize];
            let mut g = self.global;

            touch(&mut a, &mut g, &self.funding, &self.params, now_slot, oracle_price)?;

            self.accounts[idx as usize] = a;
            self.global = g;
            Ok(())
        }

        pub fn top_up_insurance_fund(&mut self, amount: u128) -> Result<()> {
            let mut g = self.global;
            g.vault_balance = g.vault_balance.checked_add(amount).ok_or(RiskError::Overflow)?;
            g.insurance_fund = g.insurance_fund.checked_add(amount).ok_or(RiskError::Overflow)?;
            self.global = g;
            Ok(())
        }

        /// Close a flat account and return its capital for transfer out.
        ///
        /// Fee debt that remaining capital cannot pay is forgiven so the slot
        /// can always be reclaimed.
        pub fn close_account(&mut self, idx: u16, now_slot: u64, oracle_price: u64) -> Result<u128> {
            self.require_used(idx)?;
            validate_oracle_price(oracle_price)?;
            let mut a = self.accounts[idx as usize];
            let mut g = self.global;

            touch(&mut a, &mut g, &self.funding, &self.params, now_slot, oracle_price)?;
            if !a.is_flat() {
                return Err(RiskError::AccountNotFlat);
            }

            if a.fee_credits < 0 {
                warn!(
                    account_id = a.account_id,
                    forgiven = a.fee_debt(),
                    "forgiving unpayable fee debt on close"
                );
                a.fee_credits = 0;
            }

            let capital = a.capital;
            withdraw_capital(&mut a, &mut g, capital)?;

            self.global = g;
            self.free_slot(idx);
            self.current_slot = self.current_slot.max(now_slot);
            info!(idx, account_id = a.account_id, capital, "account closed");
            Ok(capital)
        }

        // ========================================
        // Trading
        // ========================================

        /// Ask the LP's matcher for a fill, validate it, and settle it against
        /// `user_idx`. `Ok(None)` is an accepted zero fill.
        ///
        /// On `Err`, neither account nor any global state has changed.
        pub fn execute_trade<M: MatchingEngine>(
            &mut self,
            matcher: &M,
            lp_idx: u16,
            user_idx: u16,
            now_slot: u64,
            oracle_price: u64,
            size: i128,
        ) -> Result<Option<TradeOutcome>> {
            validate_oracle_price(oracle_price)?;
            if size == 0 {
                return Err(RiskError::InvalidTradeSize);
            }
            if size.unsigned_abs() > MAX_POSITION_ABS {
                return Err(RiskError::Overflow);
            }
            self.require_used(lp_idx)?;
            self.require_used(user_idx)?;
            if lp_idx == user_idx {
                return Err(RiskError::AccountKindMismatch);
            }

            let mut u = self.accounts[user_idx as usize];
            let mut l = self.accounts[lp_idx as usize];
            if !u.is_user() || !(l.is_lp() || l.is_pool()) {
                return Err(RiskError::AccountKindMismatch);
            }

            let result = matcher.execute_match(
                &l.matcher_program,
                &l.matcher_context,
                l.account_id,
                oracle_price,
                size,
            )?;
            let fill = match validate_match_result(&result, size)? {
                Some(fill) => fill,
                None => return Ok(None),
            };

            let mut g = self.global;
            settle_maintenance_fee(&mut u, now_slot, &self.params, &mut g)?;
            settle_maintenance_fee(&mut l, now_slot, &self.params, &mut g)?;
            let outcome = trade::execute_trade(&mut u, &mut l, fill, oracle_price, &self.funding, &mut g, &self.params)?;

            self.accounts[user_idx as usize] = u;
            self.accounts[lp_idx as usize] = l;
            self.global = g;
            self.current_slot = self.current_slot.max(now_slot);
            Ok(Some(outcome))
        }

        // ========================================
        // Liquidation
        // ========================================

        /// Liquidates `idx` if it is at or below maintenance margin.
        ///
        /// Every open position is settled to `oracle_price` first, so the
        /// haircut behind the verdict already reflects every realized loss.
        /// `NotLiquidatable` commits nothing.
        pub fn liquidate_at_oracle(&mut self, idx: u16, now_slot: u64, oracle_price: u64) -> Result<LiquidationOutcome> {
            self.require_used(idx)?;
            validate_oracle_price(oracle_price)?;
            let mut g = self.global;
            let mut staged = self.stage_open_positions(&mut g, oracle_price);

            let outcome = self.liquidate_staged(&mut staged, &mut g, idx, now_slot, oracle_price)?;

            self.commit(staged, g, now_slot);
            Ok(outcome)
        }

        /// Liquidates every eligible account in `indices`, all or nothing.
        ///
        /// Phase one settles open positions and computes each liquidation
        /// against staged copies; any hard error aborts before a single
        /// account is written. Phase two commits.
        pub fn liquidate_batch(&mut self, indices: &[u16], now_slot: u64, oracle_price: u64) -> Result<BatchLiquidation> {
            validate_oracle_price(oracle_price)?;
            for &idx in indices {
                self.require_used(idx)?;
            }
            let mut g = self.global;
            let mut staged = self.stage_open_positions(&mut g, oracle_price);
            let mut batch = BatchLiquidation::default();

            for &idx in indices {
                if batch.liquidated.iter().any(|(i, _)| *i == idx) || batch.skipped.contains(&idx) {
                    continue;
                }
                match self.liquidate_staged(&mut staged, &mut g, idx, now_slot, oracle_price) {
                    Ok(outcome) => batch.liquidated.push((idx, outcome)),
                    Err(e) if e.is_skip() => batch.skipped.push(idx),
                    Err(e) => return Err(e),
                }
            }

            self.commit(staged, g, now_slot);
            Ok(batch)
        }

        /// Settles mark, funding and losses of every open position on copies.
        /// An account whose settlement fails is left out and keeps its live
        /// state.
        fn stage_open_positions(&self, g: &mut GlobalState, oracle_price: u64) -> Staged {
            let mut staged = Staged::default();
            for idx in self.used_indices() {
                let mut a = self.accounts[idx as usize];
                if a.is_flat() {
                    continue;
                }
                let mut trial = *g;
                match settle_position(&mut a, &mut trial, &self.funding, oracle_price) {
                    Ok(()) => {
                        *g = trial;
                        staged.put(idx, a);
                    }
                    Err(e) => warn!(idx, error = %e, "settlement skipped before liquidation"),
                }
            }
            staged
        }

        fn liquidate_staged(
            &self,
            staged: &mut Staged,
            g: &mut GlobalState,
            idx: u16,
            now_slot: u64,
            oracle_price: u64,
        ) -> Result<LiquidationOutcome> {
            let mut a = staged.get(idx, &self.accounts);
            let mut trial = *g;

            // Fees are best effort here; the margin verdict comes from the
            // liquidation check itself.
            settle_maintenance_fee(&mut a, now_slot, &self.params, &mut trial)?;
            let outcome = liquidate_position(&mut a, oracle_price, &self.funding, &mut trial, &self.params)?;

            *g = trial;
            staged.put(idx, a);
            Ok(outcome)
        }

        fn commit(&mut self, staged: Staged, g: GlobalState, now_slot: u64) {
            for (idx, account) in staged.entries {
                self.accounts[idx as usize] = account;
            }
            self.global = g;
            self.current_slot = self.current_slot.max(now_slot);
        }

        // ========================================
        // Keeper crank
        // ========================================

        /// Keeper entry point: accrue funding at the stored rate, install
        /// `funding_rate_bps_per_slot` for the next interval, then scan a
        /// bounded window of slots for liquidations.
        pub fn keeper_crank(
            &mut self,
            now_slot: u64,
            oracle_price: u64,
            funding_rate_bps_per_slot: i64,
        ) -> Result<CrankOutcome> {
            validate_oracle_price(oracle_price)?;
            accrue_funding_with_rate(&mut self.funding, now_slot, oracle_price, funding_rate_bps_per_slot)?;
            self.current_slot = self.current_slot.max(now_slot);
            self.last_crank_slot = now_slot;

            let mut g = self.global;
            let mut staged = self.stage_open_positions(&mut g, oracle_price);

            let capacity = self.capacity();
            let window = (ACCOUNTS_PER_CRANK as usize).min(capacity);
            let start = self.crank_cursor as usize % capacity;
            let mut num_liquidations = 0u32;
            let mut num_liq_errors = 0u16;
            let mut attempts = 0u16;
            let mut scanned = 0usize;

            while scanned < window && attempts < LIQ_BUDGET_PER_CRANK {
                let idx = ((start + scanned) % capacity) as u16;
                scanned += 1;
                if !self.is_used(idx as usize) || staged.get(idx, &self.accounts).is_flat() {
                    continue;
                }
                attempts += 1;
                match self.liquidate_staged(&mut staged, &mut g, idx, now_slot, oracle_price) {
                    Ok(_) => num_liquidations += 1,
                    Err(e) if e.is_skip() => {}
                    Err(e) => {
                        num_liq_errors = num_liq_errors.saturating_add(1);
                        warn!(idx, error = %e, "crank liquidation failed");
                    }
                }
            }

            self.commit(staged, g, now_slot);
            let next = (start + scanned) % capacity;
            self.crank_cursor = next as u16;
            let sweep_complete = start + scanned >= capacity;
            debug!(
                now_slot,
                funding_index = self.funding.funding_index,
                num_liquidations,
                next,
                "keeper crank"
            );

            Ok(CrankOutcome {
                funding_index: self.funding.funding_index,
                num_liquidations,
                num_liq_errors,
                last_cursor: next as u16,
                sweep_complete,
            })
        }

        // ========================================
        // Queries
        // ========================================

        pub fn haircut_ratio(&self) -> (u128, u128) {
            get_haircut_ratio(&self.global)
        }

        pub fn account_view(&self, idx: u16, oracle_price: u64) -> Result<AccountView> {
            validate_oracle_price(oracle_price)?;
            let a = self.account(idx)?;
            Ok(AccountView {
                account_id: a.account_id,
                kind: a.kind(),
                capital: a.capital,
                realized_pnl: a.realized_pnl,
                position_size: a.position_size,
                entry_price: a.entry_price,
                fee_credits: a.fee_credits,
                equity: calculate_margin_equity(a, oracle_price, self.haircut_ratio()),
            })
        }

        /// `vault >= capital_total + insurance`, and the stored aggregates match
        /// the sums over live accounts.
        pub fn check_conservation(&self) -> bool {
            let g = &self.global;
            let backed = g
                .capital_total
                .checked_add(g.insurance_fund)
                .map_or(false, |owed| g.vault_balance >= owed);
            backed && self.aggregates_consistent()
        }

        fn aggregates_consistent(&self) -> bool {
            let mut capital = 0u128;
            let mut pnl_pos = 0u128;
            let mut oi = 0u128;
            for idx in self.used_indices() {
                let a = &self.accounts[idx as usize];
                capital = capital.saturating_add(a.capital);
                pnl_pos = pnl_pos.saturating_add(clamp_pos_i128(a.realized_pnl));
                oi = oi.saturating_add(a.position_size.unsigned_abs());
            }
            capital == self.global.capital_total
                && pnl_pos == self.global.pnl_positive_total
                && oi == self.global.total_open_interest
        }
    }

    /// Settled account copies keyed by slot, written back only on commit.
    #[derive(Default)]
    struct Staged {
        entries: Vec<(u16, TradingAccount)>,
    }

    impl Staged {
        fn get(&self, idx: u16, live: &[TradingAccount]) -> TradingAccount {
            self.entries
                .iter()
                .find(|(i, _)| *i == idx)
                .map_or(live[idx as usize], |(_, a)| *a)
        }

        fn put(&mut self, idx: u16, account: TradingAccount) {
            match self.entries.iter_mut().find(|(i, _)| *i == idx) {
                Some(entry) => entry.1 = account,
                None => self.entries.push((idx, account)),
            }
        }
    }

    /// Mark, funding and loss settlement of one open position.
    fn settle_position(
        a: &mut TradingAccount,
        g: &mut GlobalState,
        funding: &FundingState,
        oracle_price: u64,
    ) -> Result<()> {
        settle_mark_to_oracle(a, oracle_price, g)?;
        settle_funding_for_account(a, funding, g)?;
        settle_losses(a, g)?;
        Ok(())
    }

    /// Full settlement of one account, in the order haircut math depends on:
    /// mark and funding first, then fees and losses, then profit conversion.
    fn touch(
        a: &mut TradingAccount,
        g: &mut GlobalState,
        funding: &FundingState,
        params: &RiskParams,
        now_slot: u64,
        oracle_price: u64,
    ) -> Result<()> {
        settle_mark_to_oracle(a, oracle_price, g)?;
        settle_funding_for_account(a, funding, g)?;
        settle_maintenance_fee(a, now_slot, params, g)?;
        settle_losses(a, g)?;
        settle_profit_to_capital(a, g)?;
        pay_fee_debt_from_capital(a, g)?;
        Ok(())
    }
}

pub use constants::{MAX_ACCOUNTS, MAX_ORACLE_PRICE, MAX_POSITION_ABS};
pub use engine::{AccountView, BatchLiquidation, CrankOutcome, RiskEngine};
pub use error::{Result, RiskError};
pub use funding::{accrue_funding, settle_funding_for_account};
pub use haircut::get_haircut_ratio;
pub use liquidation::{liquidate_position, LiquidationOutcome};
pub use margin::{calculate_margin_equity, calculate_mark_pnl, check_margin_requirements, is_risk_increasing};
pub use matcher::{validate_match_result, MatchResult, MatchingEngine, NoOpMatcher, ValidatedFill};
pub use params::RiskParams;
pub use state::{AccountKind, FundingState, GlobalState, TradingAccount};
pub use trade::{execute_trade, TradeOutcome};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::{mul_bps_ceil, mul_div_floor, notional};
    use core::mem::size_of;

    #[test]
    fn pod_layouts_have_no_padding_surprises() {
        assert_eq!(size_of::<TradingAccount>(), 176);
        assert_eq!(size_of::<FundingState>(), 32);
        assert_eq!(size_of::<GlobalState>(), 112);

        let a = TradingAccount::new(AccountKind::Lp, 7);
        let bytes = bytemuck::bytes_of(&a);
        let back: TradingAccount = *bytemuck::from_bytes(bytes);
        assert_eq!(back, a);
        assert_eq!(back.kind(), Some(AccountKind::Lp));
    }

    #[test]
    fn unknown_kind_byte_is_not_a_user() {
        let mut a = TradingAccount::new(AccountKind::User, 0);
        a.kind = 9;
        assert_eq!(a.kind(), None);
        assert!(!a.is_user() && !a.is_lp() && !a.is_pool());
    }

    #[test]
    fn unrepresentable_mark_pnl_is_conservative() {
        let mut a = TradingAccount::new(AccountKind::User, 0);
        a.capital = 1_000;
        a.position_size = i128::MAX / 2;

        a.entry_price = 1;
        assert_eq!(calculate_margin_equity(&a, MAX_ORACLE_PRICE, (1, 1)), 1_000);

        a.entry_price = MAX_ORACLE_PRICE;
        assert_eq!(calculate_margin_equity(&a, 1, (1, 1)), 0);
    }

    #[test]
    fn error_codes_round_trip() {
        for e in [
            RiskError::Overflow,
            RiskError::InvalidMatcherOutput,
            RiskError::NotLiquidatable,
            RiskError::InvalidRiskParams,
            RiskError::InvalidTradeSize,
        ] {
            assert_eq!(RiskError::from_code(e.code()), Some(e));
        }
        assert_eq!(RiskError::from_code(10_000), None);
        assert!(RiskError::NotLiquidatable.is_skip());
        assert!(!RiskError::InsufficientMargin.is_skip());
    }

    #[test]
    fn fee_rounding_is_ceiling() {
        assert_eq!(mul_bps_ceil(1000, 10).unwrap(), 1);
        assert_eq!(mul_bps_ceil(1, 1).unwrap(), 1);
        assert_eq!(mul_bps_ceil(0, 10).unwrap(), 0);
        assert_eq!(mul_bps_ceil(890, 500).unwrap(), 45);
        assert_eq!(mul_bps_ceil(u128::MAX, 2), Err(RiskError::Overflow));
    }

    #[test]
    fn haircut_scaling_floors_and_never_overflows() {
        assert_eq!(mul_div_floor(100, 1, 3), 33);
        assert_eq!(mul_div_floor(100, 0, 3), 0);
        assert_eq!(mul_div_floor(100, 5, 5), 100);
        assert_eq!(mul_div_floor(100, 1, 0), 100);

        let big = u128::MAX / 2;
        let v = mul_div_floor(big, big - 1, big);
        assert!(v <= big);
        assert!(v >= big - 2);
    }

    #[test]
    fn notional_uses_price_scale() {
        assert_eq!(notional(1000, 1_000_000).unwrap(), 1000);
        assert_eq!(notional(-1000, 500_000).unwrap(), 500);
        assert_eq!(notional(i128::MIN, MAX_ORACLE_PRICE), Err(RiskError::Overflow));
    }
}
