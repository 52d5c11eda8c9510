/// Dew point in C from temperature (C) and relative humidity (percent),
/// Magnus formula with the Sonntag constants.
pub fn dew_point(temperature: f64, humidity: f64) -> f64
{
    const A: f64 = 17.62;
    const B: f64 = 243.12;
    let gamma = (humidity / 100.0).ln() + A * temperature / (B + temperature);
    B * gamma / (A - gamma)
}

/// Saturation vapor pressure in Pa (Tetens).
pub fn saturation_vapor_pressure(temperature: f64) -> f64
{
    610.78 * (temperature / (temperature + 237.3) * 17.2694).exp()
}

pub fn vapor_pressure_deficit(temperature: f64, humidity: f64) -> f64
{
    saturation_vapor_pressure(temperature) * (1.0 - humidity / 100.0)
}
