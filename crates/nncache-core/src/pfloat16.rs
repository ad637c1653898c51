//! 圧縮確率表現（16bit）
//!
//! キャッシュする方策ベクトルを小さく保つための、非負の確率専用の
//! 16bit 浮動小数点形式。
//!
//! - 符号ビットなし、指数部5bit、仮数部11bit
//! - `[0, 1]` が表現できるよう指数バイアスをずらしている
//! - 2^-31 程度未満の値は 0 に丸められる
//! - 相対誤差は最大 [`PFloat16::RELATIVE_EPSILON`]
//!
//! エンコードは単調（`a <= b` ならば `encode(a) <= encode(b)`）なので、
//! 確率の大小関係は丸め誤差の範囲内で保存される。

use std::fmt;

/// f32 のビット列から指数バイアスを引くための定数（指数 2^-31 相当）
const EXPONENT_SHIFT: u32 = 3 << 28;

/// 切り捨てる下位12bitの四捨五入用
const ROUNDING: i32 = 1 << 11;

/// 圧縮済み確率
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PFloat16(u16);

impl PFloat16 {
    /// 0.0
    pub const ZERO: Self = Self(0);

    /// 1.0
    pub const ONE: Self = Self(0xF800);

    /// エンコード→デコードの相対誤差上限（仮数部11bitの半ULP）
    pub const RELATIVE_EPSILON: f32 = 1.0 / 2048.0;

    /// 確率を圧縮する
    ///
    /// `[0, 1]` 外の値はクランプし、NaN と -0.0 は 0 として扱う。
    #[inline]
    pub fn encode(p: f32) -> Self {
        if p.is_nan() || p <= 0.0 {
            return Self::ZERO;
        }
        let p = p.min(1.0);
        let bits = (p.to_bits() as i32).wrapping_add(ROUNDING).wrapping_sub(EXPONENT_SHIFT as i32);
        if bits < 0 {
            Self::ZERO
        } else {
            Self((bits >> 12) as u16)
        }
    }

    /// 圧縮された値を f32 に戻す
    #[inline]
    pub fn decode(self) -> f32 {
        if self.0 == 0 {
            return 0.0;
        }
        f32::from_bits(((self.0 as u32) << 12) + EXPONENT_SHIFT)
    }

    /// 生の16bit値
    #[inline]
    pub const fn to_bits(self) -> u16 {
        self.0
    }

    /// 生の16bit値から復元する
    #[inline]
    pub const fn from_bits(bits: u16) -> Self {
        Self(bits)
    }
}

impl From<f32> for PFloat16 {
    #[inline]
    fn from(p: f32) -> Self {
        Self::encode(p)
    }
}

impl From<PFloat16> for f32 {
    #[inline]
    fn from(p: PFloat16) -> Self {
        p.decode()
    }
}

impl fmt::Display for PFloat16 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.decode())
    }
}
