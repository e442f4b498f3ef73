use ethers::prelude::abigen;

// Secondary fee token oracle on L2 (`Proxy__Boba_GasPriceOracle`)
abigen!(
    FeeTokenGasPriceOracle,
    r#"[
        function priceRatio() external view returns (uint256)
        function decimals() external view returns (uint256)
        function updatePriceRatio(uint256 _priceRatio, uint256 _marketPriceRatio) external
    ]"#
);
