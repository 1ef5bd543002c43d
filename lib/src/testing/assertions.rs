//! Type-safe assertion macros returning TestResult on failure.

#[macro_export]
macro_rules! assert_eq_test {
    ($left:expr, $right:expr) => {{
        let left = $left;
        let right = $right;
        if left != right {
            $crate::klog_info!("ASSERT_EQ: expected {:?}, got {:?}", right, left);
            return $crate::testing::TestResult::Fail;
        }
    }};
    ($left:expr, $right:expr, $msg:expr) => {{
        let left = $left;
        let right = $right;
        if left != right {
            $crate::klog_info!("ASSERT_EQ: {} - expected {:?}, got {:?}", $msg, right, left);
            return $crate::testing::TestResult::Fail;
        }
    }};
}

#[macro_export]
macro_rules! assert_ne_test {
    ($left:expr, $right:expr) => {{
        let left = $left;
        let right = $right;
        if left == right {
            $crate::klog_info!("ASSERT_NE: values should differ, both are {:?}", left);
            return $crate::testing::TestResult::Fail;
        }
    }};
    ($left:expr, $right:expr, $msg:expr) => {{
        let left = $left;
        let right = $right;
        if left == right {
            $crate::klog_info!("ASSERT_NE: {} - both are {:?}", $msg, left);
            return $crate::testing::TestResult::Fail;
        }
    }};
}

#[macro_export]
macro_rules! assert_test {
    ($cond:expr) => {{
        if !$cond {
            $crate::klog_info!("ASSERT: condition failed");
            return $crate::testing::TestResult::Fail;
        }
    }};
    ($cond:expr, $msg:expr) => {{
        if !$cond {
            $crate::klog_info!("ASSERT: {}", $msg);
            return $crate::testing::TestResult::Fail;
        }
    }};
    ($cond:expr, $fmt:expr, $($arg:tt)*) => {{
        if !$cond {
            $crate::klog_info!(concat!("ASSERT: ", $fmt), $($arg)*);
            return $crate::testing::TestResult::Fail;
        }
    }};
}

/// Compare two slices element-wise and report the first mismatching index.
#[macro_export]
macro_rules! assert_slice_eq_test {
    ($left:expr, $right:expr, $msg:expr) => {{
        let left = &$left[..];
        let right = &$right[..];
        if left.len() != right.len() {
            $crate::klog_info!(
                "ASSERT_SLICE_EQ: {} - length {} vs {}",
                $msg,
                left.len(),
                right.len()
            );
            return $crate::testing::TestResult::Fail;
        }
        if let Some(idx) = left.iter().zip(right.iter()).position(|(l, r)| l != r) {
            $crate::klog_info!(
                "ASSERT_SLICE_EQ: {} - index {}: expected {:?}, got {:?}",
                $msg,
                idx,
                right[idx],
                left[idx]
            );
            return $crate::testing::TestResult::Fail;
        }
    }};
}
