use ethers::prelude::abigen;

// Decimals are not exposed by this feed; they come from configuration.
abigen!(
    LastPriceFeed,
    r#"[
        function lastPrice() external view returns (uint256)
    ]"#
);
